//! Buffered delivery streams feeding the archive.

pub mod api;
mod delivery;

use std::collections::HashMap;
use std::sync::Arc;

pub use delivery::{start_background_flush, DeliveryStream, FlushHandle, StreamStats};

use crate::config::StreamConfig;
use crate::sink::ObjectSink;
use crate::PipelineError;

/// Every configured stream, addressable by name.
pub struct StreamRegistry {
    streams: Vec<Arc<DeliveryStream>>,
    by_name: HashMap<String, usize>,
}

impl StreamRegistry {
    pub fn new(configs: &[StreamConfig], objects: Arc<ObjectSink>) -> Self {
        let streams: Vec<Arc<DeliveryStream>> = configs
            .iter()
            .map(|c| Arc::new(DeliveryStream::new(c.clone(), objects.clone())))
            .collect();
        let by_name = streams
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name().to_owned(), i))
            .collect();
        Self { streams, by_name }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<DeliveryStream>> {
        self.by_name.get(name).map(|&i| &self.streams[i])
    }

    /// Look up a stream, failing with [`PipelineError::UnknownStream`].
    pub fn require(&self, name: &str) -> Result<&Arc<DeliveryStream>, PipelineError> {
        self.get(name).ok_or_else(|| PipelineError::UnknownStream {
            name: name.to_owned(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DeliveryStream>> {
        self.streams.iter()
    }

    pub fn stats(&self) -> Vec<StreamStats> {
        self.streams.iter().map(|s| s.stats()).collect()
    }

    /// Start one background flush task per stream.
    pub fn start_background_flush(&self) -> StreamFlushHandles {
        StreamFlushHandles {
            handles: self
                .streams
                .iter()
                .map(|s| start_background_flush(s.clone()))
                .collect(),
        }
    }
}

/// Flush tasks for every stream in a registry.
pub struct StreamFlushHandles {
    handles: Vec<FlushHandle>,
}

impl StreamFlushHandles {
    /// Close every stream and wait for its final flush.
    pub async fn shutdown(self) {
        futures::future::join_all(self.handles.into_iter().map(FlushHandle::shutdown)).await;
    }
}
