use crate::cli::{RemoteArgs, RestoreArgs, SaveArgs};
use eyre::{bail, Result, WrapErr};
use log::info;

use ddcache_core::remote::CacheEndpoint;
use ddcache_core::transfer::{
    archive_key, download_and_extract, download_to_file, metadata_key, upload_archive,
    upload_file,
};
use ddcache_core::{ClientIdentity, TransferConfig};

pub fn transfer_config(args: &RemoteArgs) -> Result<TransferConfig> {
    if args.branch.is_empty() {
        bail!("--branch must not be empty");
    }
    let endpoint = CacheEndpoint::parse(&args.cache_url).wrap_err_with(|| {
        format!(
            "the url grpc[s]://host:port format, {:?} is invalid",
            args.cache_url
        )
    })?;
    let identity = ClientIdentity {
        client_name: args.client_name.clone(),
        org_id: args.org_id.clone(),
        token: args.access_token.clone(),
    };
    let mut config = TransferConfig::new(endpoint, identity);
    config.retry_attempts = args.retries;
    Ok(config)
}

pub async fn run_save(args: &SaveArgs) -> Result<()> {
    let config = transfer_config(&args.remote)?;
    println!(
        "ddcache v{}: saving {} to {}",
        env!("CARGO_PKG_VERSION"),
        args.remote.branch,
        config.endpoint
    );

    let key = archive_key(&args.remote.branch);
    let archive = if args.compress.is_empty() {
        upload_file(&config, &args.cache_archive, &key).await
    } else {
        for path in &args.compress {
            if !path.exists() {
                bail!("compress path does not exist: {}", path.display());
            }
        }
        upload_archive(&config, &args.compress, &args.cache_archive, &key).await
    };
    let archive = archive.wrap_err("uploading cache archive")?;
    info!("archive stored as {} ({} attempt(s))", archive.resource_name, archive.attempts);

    let metadata = upload_file(&config, &args.cache_metadata, &metadata_key(&args.remote.branch))
        .await
        .wrap_err("uploading cache metadata")?;
    info!("metadata stored as {}", metadata.resource_name);

    println!("Files uploaded successfully");
    Ok(())
}

pub async fn run_restore(args: &RestoreArgs) -> Result<()> {
    let config = transfer_config(&args.remote)?;
    println!(
        "ddcache v{}: restoring {} from {}",
        env!("CARGO_PKG_VERSION"),
        args.remote.branch,
        config.endpoint
    );

    let key = archive_key(&args.remote.branch);
    let archive = match &args.cache_archive {
        Some(dest) => download_to_file(&config, &key, dest).await,
        None => download_and_extract(&config, &key).await,
    };
    let archive = archive.wrap_err("downloading cache archive")?;
    info!("restored {} from {}", archive.resource_name, config.endpoint);

    download_to_file(
        &config,
        &metadata_key(&args.remote.branch),
        &args.cache_metadata,
    )
    .await
    .wrap_err("downloading cache metadata")?;

    println!("Files downloaded successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(url: &str, branch: &str) -> RemoteArgs {
        RemoteArgs {
            cache_url: url.to_string(),
            access_token: "token".into(),
            branch: branch.to_string(),
            client_name: "ci".into(),
            org_id: "org".into(),
            retries: 5,
        }
    }

    #[test]
    fn config_carries_identity_and_budget() {
        let config = transfer_config(&remote("grpcs://cache.example.com:443", "main")).unwrap();
        assert!(config.endpoint.tls);
        assert_eq!(config.identity.resource_name("k"), "ci/k");
        assert_eq!(config.identity.org_id, "org");
        assert_eq!(config.retry_attempts, 5);
    }

    #[test]
    fn bad_url_is_rejected_up_front() {
        let err = transfer_config(&remote("https://cache.example.com", "main")).unwrap_err();
        assert!(format!("{err:#}").contains("grpc[s]://host:port"));
        assert!(transfer_config(&remote("grpc://h:1", "")).is_err());
    }
}
