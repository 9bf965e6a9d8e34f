//! Tokio task that drives one channel client.
//!
//! Waits on whatever the client's event loop registration asks for:
//! readability, writability, the earliest timer deadline, or a registration
//! change. Runs on the worker's `LocalSet`; the client is shared with its
//! channel through `Rc<RefCell<..>>` and borrowed only for one dispatch.

use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::channel::SharedClient;
use crate::client::ChannelHandler;
use crate::error::DisconnectReason;
use crate::transport::IoHandle;

/// Drive `client` until it disconnects or `shutdown` fires.
pub async fn drive<H: ChannelHandler>(
    client: SharedClient<H>,
    io: IoHandle,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (id, waker) = {
        let c = client.borrow();
        (c.id(), c.waker())
    };
    tracing::debug!(client = %id, "driver started");

    loop {
        let (watch, deadline) = {
            let c = client.borrow();
            (c.watch(), c.next_deadline())
        };
        // The watch goes away on disconnect.
        let Some(watch) = watch else {
            break;
        };
        let timer = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            ready = io.readable(), if watch.read => match ready {
                Ok(()) => client.borrow_mut().receive(),
                Err(e) => client.borrow_mut().disconnect(DisconnectReason::Io(e.kind())),
            },
            ready = io.writable(), if watch.write => match ready {
                Ok(()) => client.borrow_mut().push(),
                Err(e) => client.borrow_mut().disconnect(DisconnectReason::Io(e.kind())),
            },
            _ = timer => client.borrow_mut().fire_expired_timers(Instant::now()),
            _ = waker.notified() => {}
            _ = shutdown.recv() => {
                client.borrow_mut().disconnect(DisconnectReason::Local);
                break;
            }
        }
    }

    tracing::debug!(client = %id, "driver finished");
}
