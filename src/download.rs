//! Bounded-concurrency fetching of catalog targets into the scratch directory.

use std::{
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use object_store::{aws::AmazonS3Builder, path::Path as ObjectPath, ObjectStore};
use reqwest::{header::RANGE, StatusCode};
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use crate::{
    catalog::{FetchTarget, Location, RawFile},
    cli::create_progress_bar,
    error::FetchError,
};

/// Client capability handed to a fetcher for the length of one run.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Writes the bytes behind `location` to `dest`, returning the byte count.
    async fn fetch(&self, location: &Location, dest: &Path) -> Result<u64, FetchError>;
}

/// Plain HTTP(S), including ranged requests.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("wxdl/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(600))
            .build()?;

        Ok(HttpTransport { client })
    }

    async fn get_into(
        &self,
        url: &str,
        range: Option<(u64, Option<u64>)>,
        file: &mut File,
    ) -> Result<u64, FetchError> {
        let mut request = self.client.get(url);
        if let Some((start, end)) = range {
            let value = match end {
                Some(end) => format!("bytes={}-{}", start, end),
                None => format!("bytes={}-", start),
            };
            request = request.header(RANGE, value);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        // a server ignoring Range answers 200 with the whole object
        let window = range.filter(|_| status != StatusCode::PARTIAL_CONTENT);
        if window.is_some() {
            debug!("{} ignored the Range header ({}), trimming the body", url, status);
        }

        let mut written = 0u64;
        let mut offset = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let keep = match window {
                Some((start, end)) => {
                    if end.is_some_and(|end| offset > end) {
                        break;
                    }
                    in_window(offset, chunk.len(), start, end)
                }
                None => 0..chunk.len(),
            };
            offset += chunk.len() as u64;
            file.write_all(&chunk[keep.clone()]).await?;
            written += keep.len() as u64;
        }

        Ok(written)
    }
}

/// Part of a chunk starting at byte `offset` that falls inside `start..=end`.
fn in_window(offset: u64, len: usize, start: u64, end: Option<u64>) -> Range<usize> {
    let clamp = |x: u64| x.saturating_sub(offset).min(len as u64) as usize;
    let from = clamp(start);
    let to = end.map(|e| clamp(e + 1)).unwrap_or(len);
    from..to.max(from)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, location: &Location, dest: &Path) -> Result<u64, FetchError> {
        let mut file = File::create(dest).await?;

        let written = match location {
            Location::Url(url) => self.get_into(url, None, &mut file).await?,
            Location::UrlRanges { url, ranges } => {
                let mut total = 0;
                for range in ranges {
                    total += self.get_into(url, Some(*range), &mut file).await?;
                }
                total
            }
            Location::S3Key(key) => return Err(FetchError::Unsupported(key.clone())),
        };

        file.flush().await?;
        Ok(written)
    }
}

/// Anonymous reads from a public S3 bucket.
pub struct S3Transport {
    store: Arc<dyn ObjectStore>,
}

impl S3Transport {
    pub fn public(bucket: &str, region: &str) -> Result<Self, FetchError> {
        let store = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_region(region)
            .with_skip_signature(true)
            .build()?;

        Ok(S3Transport {
            store: Arc::new(store),
        })
    }
}

#[async_trait]
impl Transport for S3Transport {
    async fn fetch(&self, location: &Location, dest: &Path) -> Result<u64, FetchError> {
        let key = match location {
            Location::S3Key(key) => key,
            Location::Url(url) | Location::UrlRanges { url, .. } => {
                return Err(FetchError::Unsupported(url.clone()))
            }
        };

        let mut stream = self.store.get(&ObjectPath::from(key.as_str())).await?.into_stream();
        let mut file = File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }
}

/// Capped exponential backoff applied to every transient failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt following failure number `failures` (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = self.multiplier.powi(failures.saturating_sub(1) as i32);
        self.base_delay.mul_f64(factor).min(self.max_delay)
    }

    pub async fn run<F, Fut, T>(&self, id: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, FetchError>>,
    {
        let mut failures = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    failures += 1;
                    if !e.is_transient() || failures >= self.max_attempts {
                        return Err(e);
                    }
                    let delay = self.delay(failures);
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        id, failures, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Outcome of one fetch batch.
#[derive(Debug, Default)]
pub struct FetchReport {
    /// In catalog order.
    pub succeeded: Vec<RawFile>,
    pub failed: Vec<(FetchTarget, String)>,
    pub elapsed: Duration,
}

impl FetchReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.succeeded.iter().map(|r| r.path.clone()).collect()
    }

    pub fn print_summary(&self) {
        println!(
            "Time to download {} files: {:.1} seconds",
            self.total(),
            self.elapsed.as_secs_f64()
        );
        if !self.failed.is_empty() {
            println!("{} failed to download", self.failed.len());
            for (target, reason) in &self.failed {
                warn!("{}: {}", target.id, reason);
            }
        }
    }
}

/// Runs a catalog through a worker pool of fixed size.
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    workers: usize,
    scratch_dir: PathBuf,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, workers: usize, scratch_dir: &Path) -> Self {
        Fetcher {
            transport,
            policy: RetryPolicy::default(),
            workers: workers.max(1),
            scratch_dir: scratch_dir.to_path_buf(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Fetches every target, never failing the batch for a single target.
    #[instrument(skip(self, targets), fields(targets = targets.len(), workers = self.workers))]
    pub async fn fetch_all(&self, targets: Vec<FetchTarget>) -> FetchReport {
        let started = Instant::now();
        let pb = create_progress_bar(targets.len() as u64, "Downloading files".to_string());

        let mut results: Vec<(usize, FetchTarget, Result<PathBuf, FetchError>)> =
            stream::iter(targets.into_iter().enumerate())
                .map(|(index, target)| {
                    let pb = pb.clone();
                    async move {
                        let result = self.fetch_one(&target).await;
                        pb.inc(1);
                        (index, target, result)
                    }
                })
                .buffer_unordered(self.workers)
                .collect()
                .await;

        pb.finish_with_message("Downloads finished");
        results.sort_by_key(|(index, _, _)| *index);

        let mut report = FetchReport::default();
        for (_, target, result) in results {
            match result {
                Ok(path) => report.succeeded.push(RawFile { target, path }),
                Err(e) => report.failed.push((target, e.to_string())),
            }
        }
        report.elapsed = started.elapsed();

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "fetch batch complete"
        );
        report
    }

    async fn fetch_one(&self, target: &FetchTarget) -> Result<PathBuf, FetchError> {
        let dest = target.local_path(&self.scratch_dir);
        let partial = self.scratch_dir.join(format!("{}.partial", target.file_name));

        let bytes = self
            .policy
            .run(&target.id, || self.transport.fetch(&target.location, &partial))
            .await;

        match bytes {
            Ok(bytes) => {
                tokio::fs::rename(&partial, &dest).await?;
                debug!("{} -> {} ({} bytes)", target.id, dest.display(), bytes);
                Ok(dest)
            }
            Err(e) => {
                match tokio::fs::remove_file(&partial).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => warn!("could not remove {}: {}", partial.display(), err),
                }
                Err(e)
            }
        }
    }
}

// -- Tests -------------------------------------------------------------------
