use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

/// One stream of concurrent requests against the shared image cache.
#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// The number of requests in flight at any time.
    pub concurrency: usize,
    /// How many consecutive requests ask for the same image.
    ///
    /// With a value greater than one, concurrent requests for the same image are coalesced into
    /// a single download.
    #[serde(default = "default_duplicates")]
    pub duplicates: usize,
    /// Artificial latency of the image server for every download.
    #[serde(default, with = "humantime_serde")]
    pub latency: Option<Duration>,
    /// Cancel every n-th request shortly after it was issued.
    #[serde(default)]
    pub cancel_every: Option<usize>,
}

fn default_duplicates() -> usize {
    1
}

impl Workload {
    /// The server path of the image requested by the `op`-th request of workload `index`.
    pub fn image_path(&self, index: usize, op: usize) -> String {
        let image = op / self.duplicates.max(1);
        let path = format!("image/{index}/{image}.png");
        match self.latency {
            Some(latency) => format!("delay/{}ms/{path}", latency.as_millis()),
            None => path,
        }
    }

    /// Whether the `op`-th request should be cancelled.
    pub fn should_cancel(&self, op: usize) -> bool {
        match self.cancel_every {
            Some(n) if n > 0 => op % n == n - 1,
            _ => false,
        }
    }
}
