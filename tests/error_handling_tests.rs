use seriald::core::server::{Command, ParseError, Reply};
use seriald::{CloseErrors, Lifecycle, SerialdError, SerialdResult};
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Error handling and resilience tests
#[cfg(test)]
mod error_handling_tests {
    use super::*;

    #[test]
    fn test_error_messages_reach_the_wire_verbatim() {
        let cases = vec![
            (SerialdError::NotFound, "not found"),
            (
                SerialdError::AlreadyOpen { path: "/dev/ttyUSB0".to_string() },
                "/dev/ttyUSB0 is already open",
            ),
            (
                SerialdError::NotOpen { path: "/dev/ttyUSB0".to_string() },
                "/dev/ttyUSB0 is not open.",
            ),
            (
                SerialdError::Protocol("Parse BaudRate error: x".to_string()),
                "Parse BaudRate error: x",
            ),
        ];

        for (error, expected) in cases {
            let reply = Reply::error(&error);
            assert_eq!(reply.error.as_deref(), Some(expected));
            assert!(reply.value.is_none());
        }
    }

    #[test]
    fn test_io_error_conversion_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let error: SerialdError = io.into();
        assert!(error.to_string().contains("pipe closed"));
        assert!(error.source().is_some());
        assert!(!error.is_not_found());
    }

    #[test]
    fn test_close_errors_aggregate_into_crate_error() {
        let mut errors = CloseErrors::new();
        errors.push("/dev/ttyS0", Err::<(), _>("device busy"));
        errors.push("/dev/ttyS1", Ok::<(), &str>(()));
        errors.push("/dev/ttyS2", Err::<(), _>("reset"));

        let error: SerialdError = errors.into_result().unwrap_err().into();
        assert_eq!(error.to_string(), "/dev/ttyS0: device busy ~~~ /dev/ttyS2: reset");
    }

    #[test]
    fn test_parse_errors_are_not_fatal_except_open() {
        let errors = [
            Command::parse("").unwrap_err(),
            Command::parse("ls extra").unwrap_err(),
            Command::parse("find \"unterminated").unwrap_err(),
        ];
        assert!(errors.iter().all(|e| !e.is_fatal()));
        assert_eq!(errors[0], ParseError::Unknown);
        assert!(Command::parse("open a b c").unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_failing_stage_does_not_skip_the_others() {
        let lifecycle = Lifecycle::new("test");
        let ran = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let ran = Arc::clone(&ran);
            lifecycle.add_closer(move || async move {
                ran.fetch_add(1, Ordering::SeqCst);
                if i == 1 {
                    let mut errors = CloseErrors::new();
                    errors.push("", Err::<(), _>("second closer broke"));
                    return errors.into_result();
                }
                Ok(())
            });
        }

        let result: SerialdResult<()> = lifecycle.close().await.map_err(SerialdError::from);
        let error = result.unwrap_err();
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert!(error.to_string().contains("second closer broke"));

        let again = lifecycle.close().await.unwrap_err();
        assert_eq!(again.len(), 1);
    }


    #[test]
    fn test_error_thread_safety() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SerialdError>();
        assert_send_sync::<CloseErrors>();
    }
}
