/*!
Tests for error display, conversions and classification.
*/

#[cfg(test)]
mod tests {
    use crate::error::{ErrorKind, RekindleError};
    use crate::storage::RemoteError;
    use rekindle_retry::RetryableError;
    use std::io;
    use std::time::Duration;

    #[test]
    fn test_rekindle_error_display() {
        let error = RekindleError::validation("test validation error");
        assert_eq!(error.to_string(), "Validation error: test validation error");

        let error = RekindleError::codec("unknown table 'ghosts'");
        assert_eq!(error.to_string(), "Codec error: unknown table 'ghosts'");

        let error = RekindleError::MissingFile {
            blob_id: "abc".to_string(),
            file: "snapshot.json".to_string(),
        };
        assert_eq!(error.to_string(), "Blob abc has no file named snapshot.json");
    }

    #[test]
    fn test_from_io_error_is_local_io() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = RekindleError::from(io_error);

        assert!(matches!(error, RekindleError::Io(_)));
        assert_eq!(error.kind(), ErrorKind::LocalIo);
    }

    #[test]
    fn test_from_json_error_is_codec() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error = RekindleError::from(json_error);

        assert!(matches!(error, RekindleError::Json(_)));
        assert_eq!(error.kind(), ErrorKind::Codec);
    }

    #[test]
    fn test_remote_errors_map_to_taxonomy() {
        let cases = [
            (RemoteError::Unauthorized { status: 401 }, ErrorKind::Auth),
            (RemoteError::NotFound("gone".into()), ErrorKind::NotFound),
            (
                RemoteError::RateLimited {
                    retry_after: Some(Duration::from_secs(60)),
                },
                ErrorKind::TransientNetwork,
            ),
            (
                RemoteError::ServerError {
                    status: 502,
                    message: "bad gateway".into(),
                },
                ErrorKind::TransientNetwork,
            ),
            (RemoteError::Timeout, ErrorKind::TransientNetwork),
            (RemoteError::Transport("reset".into()), ErrorKind::TransientNetwork),
        ];

        for (remote, expected) in cases {
            let error = RekindleError::from(remote);
            assert_eq!(error.kind(), expected, "{error}");
        }
    }

    #[test]
    fn test_retry_classification() {
        assert!(RekindleError::from(RemoteError::Timeout).is_transient());
        assert!(RekindleError::codec("bad row").is_transient());
        assert!(RekindleError::from(RemoteError::NotFound("x".into())).is_transient());
        assert!(RekindleError::from(RemoteError::Unauthorized { status: 403 }).is_permanent());
        assert!(RekindleError::config("missing credential").is_permanent());
    }

    #[test]
    fn test_integrity_check_failed_error() {
        let error = RekindleError::IntegrityCheckFailed {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };

        assert!(error.to_string().contains("abc123"));
        assert!(error.to_string().contains("def456"));
        assert_eq!(error.kind(), ErrorKind::Codec);
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RekindleError>();
        assert_sync::<RekindleError>();
    }
}
