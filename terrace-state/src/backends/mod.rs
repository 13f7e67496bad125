//! Backend implementations for state storage

mod local;
mod s3;

pub use local::LocalBackend;
pub use s3::S3Backend;

use terrace_core::loader::BackendSettings;

use crate::backend::{BackendError, BackendResult, StateBackend};

/// Create a backend from a `backend` block
///
/// This function dispatches to the appropriate backend implementation
/// based on the backend type named in the block.
pub async fn create_backend(config: &BackendSettings) -> BackendResult<Box<dyn StateBackend>> {
    match config.backend_type.as_str() {
        "local" => Ok(Box::new(LocalBackend::from_config(config)?)),
        "s3" => {
            let backend = S3Backend::from_config(config).await?;
            Ok(Box::new(backend))
        }
        other => Err(BackendError::unsupported_backend(other)),
    }
}

/// Backend for a configuration; without a `backend` block state is kept in
/// the local default file
pub async fn backend_for(config: Option<&BackendSettings>) -> BackendResult<Box<dyn StateBackend>> {
    match config {
        Some(config) => create_backend(config).await,
        None => Ok(Box::new(LocalBackend::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_unsupported_backend() {
        let config = BackendSettings {
            backend_type: "gcs".to_string(),
            attributes: HashMap::new(),
        };

        match create_backend(&config).await {
            Err(BackendError::UnsupportedBackend(name)) => assert_eq!(name, "gcs"),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("Expected UnsupportedBackend error"),
        }
    }

    #[tokio::test]
    async fn test_default_backend_is_local() {
        let backend = backend_for(None).await.unwrap();
        assert_eq!(backend.location(), LocalBackend::DEFAULT_STATE_FILE);
    }

    #[tokio::test]
    async fn test_s3_backend_requires_bucket() {
        let config = BackendSettings {
            backend_type: "s3".to_string(),
            attributes: HashMap::new(),
        };
        assert!(matches!(
            create_backend(&config).await,
            Err(BackendError::Configuration(_))
        ));
    }
}
