use futures_util::future::BoxFuture;
use letterbox::{
    error::Error,
    message::{MessageKind, MessageRecord},
    processor::Transport,
};

/// Stand-in transport for running the store on its own: logs every message
/// it is asked to deliver and reports success.
struct LogTransport;

impl Transport for LogTransport {
    fn send<'a>(
        &'a self,
        kind: MessageKind,
        record: &'a MessageRecord,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            tracing::info!(id = record.id, %kind, name = %record.name, "Delivering message");
            Ok(())
        })
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    letterbox::run().transport(LogTransport).start().await
}
