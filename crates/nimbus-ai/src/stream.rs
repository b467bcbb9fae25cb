//! Token streams and completion assembly

use std::pin::Pin;

use async_stream::stream;
use futures::StreamExt;
use tokio_stream::Stream;

use crate::error::{Error, Result};
use crate::sse::{SseDecoder, StreamChunk};

/// A stream of completion text deltas. Ends after the completion marker;
/// an `Err` item is always the last one.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Callback invoked with every delta as it arrives. Runs inline on the decode
/// path, so it must not block.
pub type TokenCallback<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Turn a raw byte stream carrying SSE events into a [`TokenStream`].
///
/// A transport that closes before the `[DONE]` marker yields `Error::Sse`.
pub fn token_stream<S, B, E>(bytes: S) -> TokenStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<Error> + Send + 'static,
{
    Box::pin(stream! {
        let mut bytes = Box::pin(bytes);
        let mut decoder = SseDecoder::new();

        while let Some(chunk) = bytes.next().await {
            let units = match chunk {
                Ok(chunk) => match decoder.push_bytes(chunk.as_ref()) {
                    Ok(units) => units,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                },
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            };

            for unit in units {
                match unit {
                    StreamChunk::Text(text) => yield Ok(text),
                    StreamChunk::Done => return,
                    StreamChunk::Malformed(detail) => {
                        yield Err(Error::Decode(detail));
                        return;
                    }
                    StreamChunk::Failed { error_type, message } => {
                        yield Err(Error::api(error_type, message));
                        return;
                    }
                }
            }
        }

        for unit in decoder.finish() {
            match unit {
                StreamChunk::Text(text) => yield Ok(text),
                StreamChunk::Done => return,
                StreamChunk::Malformed(detail) => {
                    yield Err(Error::Decode(detail));
                    return;
                }
                StreamChunk::Failed { error_type, message } => {
                    yield Err(Error::api(error_type, message));
                    return;
                }
            }
        }

        yield Err(Error::Sse("stream ended before completion marker".to_string()));
    })
}

/// Drain a token stream, forwarding each delta to `on_token`, and resolve with
/// the full text in arrival order. The first error aborts assembly; no partial
/// text is returned.
pub async fn collect_completion(
    mut tokens: TokenStream,
    mut on_token: Option<TokenCallback<'_>>,
) -> Result<String> {
    let mut text = String::new();
    while let Some(delta) = tokens.next().await {
        let delta = delta?;
        if let Some(callback) = on_token.as_deref_mut() {
            callback(&delta);
        }
        text.push_str(&delta);
    }
    Ok(text)
}

/// A token stream that yields the given deltas and then ends. Handy for
/// backends that already hold the full text, and for tests.
pub fn text_stream(deltas: Vec<String>) -> TokenStream {
    Box::pin(futures::stream::iter(deltas.into_iter().map(Ok)))
}
