use std::time::Duration;
use tokio::sync::watch;

/// Cooperative stop flag, checked between units of work.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleeps for `duration`, returning `true` early if shutdown is requested.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let mut rx = self.rx.clone();
        if *rx.borrow_and_update() {
            return true;
        }

        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        (&mut sleep).await;
                        return false;
                    }
                    if *rx.borrow() {
                        return true;
                    }
                }
            }
        }
    }
}
