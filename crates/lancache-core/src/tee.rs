//! Bounded streaming tee into the store

use bytes::Bytes;
use futures::StreamExt;
use lancache_store::{ByteStream, Store, StoreError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Channel depth per side of the tee. Memory per in-flight miss is
/// bounded by 2 × capacity × chunk size.
const TEE_CAPACITY: usize = 8;

/// Tee an upstream blob body to the client and into the store.
///
/// Returns the client-facing stream plus a handle resolving to the
/// store write's outcome. The source is fanned out through two bounded
/// channels: a slow client backpressures the upstream read, and a slow
/// disk write backpressures it too, so no side buffers the body.
///
/// A client disconnect only closes the client channel; the store write
/// keeps draining the source to EOF so the download still populates
/// the cache. A digest mismatch at commit time discards the staged
/// file inside `Store::store_blob`; the client has already received
/// whatever upstream sent.
pub fn tee_to_store(
    store: Arc<Store>,
    digest: &str,
    mut source: ByteStream,
) -> (ByteStream, tokio::task::JoinHandle<Result<u64, StoreError>>) {
    let (client_tx, client_rx) = mpsc::channel::<Result<Bytes, StoreError>>(TEE_CAPACITY);
    let (store_tx, store_rx) = mpsc::channel::<Result<Bytes, StoreError>>(TEE_CAPACITY);

    tokio::spawn(async move {
        let mut client_gone = false;
        while let Some(chunk) = source.next().await {
            match chunk {
                Ok(chunk) => {
                    if !client_gone && client_tx.send(Ok(chunk.clone())).await.is_err() {
                        debug!("Client disconnected during tee, continuing store write");
                        client_gone = true;
                    }
                    if store_tx.send(Ok(chunk)).await.is_err() {
                        // Store side gave up; nothing left to feed.
                        break;
                    }
                }
                Err(e) => {
                    if !client_gone {
                        let _ = client_tx
                            .send(Err(StoreError::Io(std::io::Error::other(e.to_string()))))
                            .await;
                    }
                    let _ = store_tx.send(Err(e)).await;
                    return;
                }
            }
        }
    });

    let digest = digest.to_string();
    let handle = tokio::spawn(async move {
        let stream: ByteStream = Box::pin(ReceiverStream::new(store_rx));
        store.store_blob(&digest, stream).await
    });

    let client_stream: ByteStream = Box::pin(ReceiverStream::new(client_rx));
    (client_stream, handle)
}
