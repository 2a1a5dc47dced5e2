use tonic::Status;

/// Error kinds surfaced to RPC callers as distinct status classes.
///
/// Components return these directly; only the gRPC facade converts them to
/// wire statuses, so identifier-bearing kinds keep their identifier all the
/// way up.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Image {0} not found")]
    ImageNotFound(String),
    #[error("Image {0} found but not active")]
    ImageNotActive(String),
    #[error("Flavor {0} not found")]
    FlavorNotFound(String),
    #[error("Instance {0} not found")]
    ServerNotFound(String),
    #[error("Volume {0} not found")]
    VolumeNotFound(String),
    #[error("Volume snapshot {0} not found")]
    SnapshotNotFound(String),
    #[error("Security group {0} not found")]
    SecurityGroupNotFound(String),
    #[error("Backend {0} not found")]
    BackendNotFound(String),
    #[error("No suitable template version found for {0}")]
    TemplateNotFound(String),
    #[error("Cluster {0} not found")]
    ClusterNotFound(String),
    #[error("No active playbook found for {0}")]
    PlaybookNotFound(String),

    /// The backend rejected the request because of in-progress state,
    /// e.g. deleting a server while a snapshot is uploading.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Quota exhausted or the storage backend refused the allocation.
    #[error("resource not available: {0}")]
    ResourceNotAvailable(String),

    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("state store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl From<ClientError> for Status {
    fn from(err: ClientError) -> Self {
        use ClientError::*;

        let message = err.to_string();
        match err {
            ImageNotFound(_) | FlavorNotFound(_) | ServerNotFound(_) | VolumeNotFound(_)
            | SnapshotNotFound(_) | SecurityGroupNotFound(_) | BackendNotFound(_)
            | TemplateNotFound(_) | ClusterNotFound(_) | PlaybookNotFound(_) => {
                Status::not_found(message)
            }
            ImageNotActive(_) | Config(_) => Status::failed_precondition(message),
            Conflict(_) => Status::aborted(message),
            ResourceNotAvailable(_) => Status::resource_exhausted(message),
            Validation(_) => Status::invalid_argument(message),
            Store(_) | Http(_) | Io(_) | Yaml(_) | Internal(_) => Status::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_kinds_map_to_not_found() {
        let status = Status::from(ClientError::ImageNotFound("ubuntu-22.04".into()));
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert!(status.message().contains("ubuntu-22.04"));

        let status = Status::from(ClientError::PlaybookNotFound("abc123".into()));
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[test]
    fn test_conflict_maps_to_aborted() {
        let status = Status::from(ClientError::Conflict("task_state in image creating".into()));
        assert_eq!(status.code(), tonic::Code::Aborted);
    }

    #[test]
    fn test_quota_maps_to_resource_exhausted() {
        let status = Status::from(ClientError::ResourceNotAvailable("volume quota".into()));
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
    }

    #[test]
    fn test_inactive_image_maps_to_failed_precondition() {
        let status = Status::from(ClientError::ImageNotActive("old-image".into()));
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }
}
