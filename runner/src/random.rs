//! Weighted-random request stream.
use std::sync::Arc;

use kubeload_common::profile::{LoadProfileSpec, ProfileError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::request::{RequestBuilder, UnsupportedRequest};

/// Errors from building the stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The profile spec is invalid.
    #[error("invalid load profile spec: {0}")]
    Profile(#[from] ProfileError),
    /// A request entry cannot be generated.
    #[error(transparent)]
    Unsupported(#[from] UnsupportedRequest),
}

/// Produces a bounded lazy sequence of request builders, sampled by the
/// profile's share weights.
///
/// The stream emits exactly `total` builders over a rendezvous channel and
/// then closes it; cancellation closes it early. Sampling uses a
/// cryptographically seeded RNG so the pick distribution does not depend on
/// consumer scheduling.
pub struct WeightedRandomRequests {
    shares: Vec<u32>,
    builders: Vec<Arc<RequestBuilder>>,
    cancel: CancellationToken,
}

impl WeightedRandomRequests {
    /// Validate the spec and map every entry to a builder.
    pub fn new(spec: &LoadProfileSpec) -> Result<Self, StreamError> {
        spec.validate()?;

        let mut shares = Vec::with_capacity(spec.requests.len());
        let mut builders = Vec::with_capacity(spec.requests.len());
        for req in &spec.requests {
            shares.push(req.shares);
            builders.push(Arc::new(RequestBuilder::from_weighted(req)?));
        }

        Ok(Self {
            shares,
            builders,
            cancel: CancellationToken::new(),
        })
    }

    /// Start emitting `total` builders over the returned stream.
    pub fn run(&self, total: usize) -> RequestStream {
        let (tx, rx) = mpsc::channel(1);
        let shares = self.shares.clone();
        let builders = self.builders.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let sum: u64 = shares.iter().map(|s| *s as u64).sum();
            let mut rng = StdRng::from_entropy();
            for _ in 0..total {
                let builder = builders[pick(&mut rng, &shares, sum)].clone();
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(builder) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            // tx drops here, closing the channel after `total` emissions.
        });

        RequestStream {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Stop the producer. Consumers observe end-of-stream after any
    /// buffered builder drains.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Consumer handle for the stream, shareable across workers. Receives are
/// serialized so the channel keeps a single consumer at a time.
#[derive(Clone)]
pub struct RequestStream {
    rx: Arc<Mutex<mpsc::Receiver<Arc<RequestBuilder>>>>,
}

impl RequestStream {
    /// Receive the next builder, or `None` once the stream closed.
    pub async fn recv(&self) -> Option<Arc<RequestBuilder>> {
        self.rx.lock().await.recv().await
    }
}

fn pick(rng: &mut StdRng, shares: &[u32], sum: u64) -> usize {
    let mut rnd = rng.gen_range(0..sum);
    for (idx, share) in shares.iter().enumerate() {
        let share = *share as u64;
        if rnd < share {
            return idx;
        }
        rnd -= share;
    }
    unreachable!("pick is bounded by the sum of shares");
}

#[cfg(test)]
mod tests {
    use kubeload_common::profile::{LoadProfileSpec, RequestGet, WeightedRequest};

    use super::*;

    fn spec(shares: &[u32]) -> LoadProfileSpec {
        LoadProfileSpec {
            total: 1,
            conns: 1,
            requests: shares
                .iter()
                .enumerate()
                .map(|(idx, shares)| WeightedRequest {
                    shares: *shares,
                    stale_get: Some(RequestGet {
                        version: "v1".into(),
                        resource: "pods".into(),
                        namespace: "default".into(),
                        name: format!("x{idx}"),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn emits_exactly_total_then_closes() {
        let reqs = WeightedRandomRequests::new(&spec(&[1, 2])).unwrap();
        let stream = reqs.run(100);

        let mut count = 0;
        while stream.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 100);
        // Stream stays closed.
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn relative_frequencies_track_shares() {
        let reqs = WeightedRandomRequests::new(&spec(&[100, 400])).unwrap();
        let total = 5000usize;
        let stream = reqs.run(total);

        let mut first = 0usize;
        while let Some(builder) = stream.recv().await {
            let base = url::Url::parse("https://example.invalid").unwrap();
            if builder.url(&base).path().ends_with("/x0") {
                first += 1;
            }
        }

        let observed = first as f64 / total as f64;
        assert!(
            (observed - 0.2).abs() < 0.03,
            "share 100/500 should emit ~20%, got {observed}"
        );
    }

    #[tokio::test]
    async fn stop_closes_the_stream_early() {
        let reqs = WeightedRandomRequests::new(&spec(&[1])).unwrap();
        let stream = reqs.run(1_000_000);

        assert!(stream.recv().await.is_some());
        reqs.stop();

        let mut drained = 0;
        while stream.recv().await.is_some() {
            drained += 1;
        }
        // At most the single buffered builder remains after cancel.
        assert!(drained <= 1, "drained {drained} builders after stop");
    }

    #[test]
    fn rejects_unsupported_put() {
        let mut spec = spec(&[1]);
        spec.requests[0].stale_get = None;
        spec.requests[0].put = Some(kubeload_common::profile::RequestPut {
            version: "v1".into(),
            resource: "configmaps".into(),
            name_prefix: "kubeload-".into(),
            key_space_size: 10,
            value_size: 10,
            ..Default::default()
        });
        assert!(matches!(
            WeightedRandomRequests::new(&spec),
            Err(StreamError::Unsupported(UnsupportedRequest::Put))
        ));
    }
}
