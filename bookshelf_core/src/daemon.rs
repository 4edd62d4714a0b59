//! Long-running components with an explicit start/stop lifecycle.

use std::future::Future;

use async_trait::async_trait;
use tracing::{error, info};

#[async_trait]
pub trait Daemon: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    fn name(&self) -> &str;

    async fn start(&mut self) -> Result<(), Self::Error>;

    /// Must be safe to call more than once.
    async fn stop(&mut self) -> Result<(), Self::Error>;
}

/// Start `daemon`, wait for `shutdown`, then stop it.
///
/// A start failure is returned immediately without waiting. A stop failure is logged and
/// returned.
pub async fn run_daemon<D, F>(daemon: &mut D, shutdown: F) -> Result<(), D::Error>
where
    D: Daemon,
    F: Future<Output = ()> + Send,
{
    let name = daemon.name().to_owned();
    info!(daemon = %name, "starting");
    daemon.start().await?;
    info!(daemon = %name, "started");

    shutdown.await;

    info!(daemon = %name, "stopping");
    match daemon.stop().await {
        Ok(()) => {
            info!(daemon = %name, "stopped");
            Ok(())
        }
        Err(e) => {
            error!(daemon = %name, error = %e, "failed to stop");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("refused")]
    struct Refused;

    #[derive(Default)]
    struct Recorder {
        events: Vec<&'static str>,
        fail_start: bool,
    }

    #[async_trait]
    impl Daemon for Recorder {
        type Error = Refused;

        fn name(&self) -> &str {
            "recorder"
        }

        async fn start(&mut self) -> Result<(), Refused> {
            self.events.push("start");
            if self.fail_start {
                return Err(Refused);
            }
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), Refused> {
            self.events.push("stop");
            Ok(())
        }
    }

    #[test]
    fn runs_start_then_stop_around_shutdown() {
        let mut d = Recorder::default();
        futures::executor::block_on(run_daemon(&mut d, async {})).unwrap();
        assert_eq!(d.events, vec!["start", "stop"]);
    }

    #[test]
    fn start_failure_skips_stop() {
        let mut d = Recorder {
            fail_start: true,
            ..Recorder::default()
        };
        let res = futures::executor::block_on(run_daemon(&mut d, async {}));
        assert!(res.is_err());
        assert_eq!(d.events, vec!["start"]);
    }
}
