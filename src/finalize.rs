//! Post-upload integrity tagging.

use tracing::{debug, info};

use crate::errors::PushError;
use crate::retry::RetryPolicy;
use crate::storage::backend::PageBlobStore;
use crate::upload::StorageTarget;

/// Record `md5` (base64) as the blob's Content-MD5 and read it back.
///
/// Does nothing when no digest was computed.  Any failure, including a
/// read-back that does not show the digest, is an integrity error.
pub async fn finalize(
    store: &dyn PageBlobStore,
    target: &StorageTarget,
    md5: Option<&str>,
    retry: &RetryPolicy,
) -> Result<(), PushError> {
    let Some(md5) = md5 else {
        debug!("No digest computed, skipping Content-MD5 for {}", target);
        return Ok(());
    };
    let (container, blob) = (&target.container_name, &target.blob_name);

    retry
        .run("set blob properties", || {
            store.set_content_md5(container, blob, md5)
        })
        .await
        .map_err(PushError::Integrity)?;

    let props = retry
        .run("get blob properties", || {
            store.get_blob_properties(container, blob)
        })
        .await
        .map_err(PushError::Integrity)?;

    match props.and_then(|p| p.content_md5) {
        Some(stored) if stored == md5 => {
            info!("Set Content-MD5 {} on {}", md5, target);
            Ok(())
        }
        other => Err(PushError::Integrity(anyhow::anyhow!(
            "blob {} reports Content-MD5 {:?}, expected {}",
            target,
            other,
            md5
        ))),
    }
}
