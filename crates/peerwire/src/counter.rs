//! Transfer counters with smoothed rates.
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::{sync::Mutex, time::Instant};

/// Weight of the newest sample on the moving average.
const EMA_ALPHA: f64 = 0.3;

#[derive(Debug)]
struct Rates {
    last_update: Instant,
    download: f64,
    upload: f64,
}

/// Bytes transferred by a torrent or a peer, and their rates in bytes per
/// second as an exponential moving average.
#[derive(Debug)]
pub struct Counter {
    downloaded: AtomicU64,
    uploaded: AtomicU64,
    window_downloaded: AtomicU64,
    window_uploaded: AtomicU64,
    download_rate: AtomicU64,
    upload_rate: AtomicU64,
    rates: Mutex<Rates>,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            window_downloaded: AtomicU64::new(0),
            window_uploaded: AtomicU64::new(0),
            download_rate: AtomicU64::new(0),
            upload_rate: AtomicU64::new(0),
            rates: Mutex::new(Rates {
                last_update: Instant::now(),
                download: 0.0,
                upload: 0.0,
            }),
        }
    }
}

fn ema(previous: f64, sample: f64) -> f64 {
    if previous == 0.0 {
        sample
    } else {
        EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * previous
    }
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_download(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_upload(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// Bytes per second, as of the last [`Counter::update_rates`].
    pub fn download_rate(&self) -> u64 {
        self.download_rate.load(Ordering::Relaxed)
    }

    pub fn upload_rate(&self) -> u64 {
        self.upload_rate.load(Ordering::Relaxed)
    }

    /// Fold the bytes recorded since the last call into the rates.
    pub async fn update_rates(&self) {
        let now = Instant::now();
        let mut rates = self.rates.lock().await;
        let elapsed = now.duration_since(rates.last_update).as_secs_f64();

        if elapsed < 0.001 {
            return;
        }

        let downloaded = self.window_downloaded.swap(0, Ordering::Relaxed);
        let uploaded = self.window_uploaded.swap(0, Ordering::Relaxed);

        rates.download = ema(rates.download, downloaded as f64 / elapsed);
        rates.upload = ema(rates.upload, uploaded as f64 / elapsed);
        rates.last_update = now;

        self.download_rate.store(rates.download as u64, Ordering::Relaxed);
        self.upload_rate.store(rates.upload as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time;

    #[tokio::test(start_paused = true)]
    async fn smoothed_rates() {
        let counter = Counter::new();

        counter.record_download(1000);
        counter.record_upload(500);
        time::advance(Duration::from_secs(1)).await;
        counter.update_rates().await;

        // the first sample is taken as is
        assert_eq!(counter.download_rate(), 1000);
        assert_eq!(counter.upload_rate(), 500);

        counter.record_download(2000);
        time::advance(Duration::from_secs(1)).await;
        counter.update_rates().await;

        // 0.3 * 2000 + 0.7 * 1000
        assert!((1299..=1300).contains(&counter.download_rate()));
        // 0.3 * 0 + 0.7 * 500
        assert!((349..=350).contains(&counter.upload_rate()));

        assert_eq!(counter.downloaded(), 3000);
        assert_eq!(counter.uploaded(), 500);
    }
}
