use std::path::Path;

use serde::{Deserialize, Serialize};

/// Per-epoch training summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// Zero-based epoch index.
    pub epoch: usize,
    /// Mean total loss over the epoch's steps.
    pub loss: f64,
    pub triplet_loss: f64,
    pub classification_loss: f64,
    /// Learning rate used during the epoch.
    pub lr: f64,
    /// Held-out mean same-class count among the top-k neighbours.
    pub mean_common: f64,
}

/// Ordered record of epoch metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsHistory {
    epochs: Vec<EpochMetrics>,
}

impl MetricsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn epochs(&self) -> &[EpochMetrics] {
        &self.epochs
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    /// Epoch with the highest validation `mean_common`. Earliest wins ties.
    pub fn best(&self) -> Option<&EpochMetrics> {
        self.epochs.iter().fold(None, |best, m| match best {
            Some(b) if b.mean_common >= m.mean_common => Some(b),
            _ => Some(m),
        })
    }

    /// True if the mean loss of the last `window` epochs is below the mean of
    /// the `window` epochs before them. Needs `2 * window` entries.
    pub fn is_improving(&self, window: usize) -> bool {
        if window == 0 || self.epochs.len() < 2 * window {
            return false;
        }
        let n = self.epochs.len();
        let mean = |slice: &[EpochMetrics]| {
            slice.iter().map(|m| m.loss).sum::<f64>() / slice.len() as f64
        };
        mean(&self.epochs[n - window..]) < mean(&self.epochs[n - 2 * window..n - window])
    }

    /// Write the history as pretty JSON.
    pub fn save_json(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", path.display()))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", path.display()))
    }
}

/// Running mean of the three loss components over a span of steps.
#[derive(Debug, Clone, Default)]
pub struct RunningAvg {
    loss: f64,
    triplet: f64,
    classification: f64,
    count: usize,
}

impl RunningAvg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, loss: f64, triplet: f64, classification: f64) {
        self.loss += loss;
        self.triplet += triplet;
        self.classification += classification;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// `(loss, triplet, classification)` means, or `None` before any update.
    pub fn means(&self) -> Option<(f64, f64, f64)> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some((self.loss / n, self.triplet / n, self.classification / n))
    }

    pub fn display(&self) -> String {
        match self.means() {
            Some((loss, triplet, ce)) => {
                format!("loss={loss:.4} triplet={triplet:.4} ce={ce:.4}")
            }
            None => "no data".to_string(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch(epoch: usize, loss: f64, mean_common: f64) -> EpochMetrics {
        EpochMetrics {
            epoch,
            loss,
            triplet_loss: loss / 2.0,
            classification_loss: loss / 2.0,
            lr: 0.01,
            mean_common,
        }
    }

    #[test]
    fn test_best_picks_highest_mean_common() {
        let mut history = MetricsHistory::new();
        assert!(history.best().is_none());
        history.push(epoch(0, 1.0, 40.0));
        history.push(epoch(1, 0.8, 72.5));
        history.push(epoch(2, 0.7, 72.5));
        history.push(epoch(3, 0.6, 60.0));
        assert_eq!(history.best().unwrap().epoch, 1);
        assert_eq!(history.last().unwrap().epoch, 3);
        assert_eq!(history.len(), 4);
    }

    #[test]
    fn test_is_improving() {
        let mut history = MetricsHistory::new();
        for (i, loss) in [1.0, 0.9, 0.7, 0.6].into_iter().enumerate() {
            history.push(epoch(i, loss, 0.0));
        }
        assert!(history.is_improving(2));
        assert!(!history.is_improving(3), "not enough epochs");
        assert!(!history.is_improving(0));

        history.push(epoch(4, 2.0, 0.0));
        history.push(epoch(5, 2.0, 0.0));
        assert!(!history.is_improving(2));
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.json");

        let mut history = MetricsHistory::new();
        history.push(epoch(0, 1.25, 30.0));
        history.push(epoch(1, 0.5, 55.0));
        history.save_json(&path).unwrap();

        let loaded = MetricsHistory::load_json(&path).unwrap();
        assert_eq!(loaded.epochs(), history.epochs());
    }

    #[test]
    fn test_running_avg() {
        let mut avg = RunningAvg::new();
        assert!(avg.means().is_none());
        assert_eq!(avg.display(), "no data");

        avg.update(1.0, 0.4, 0.6);
        avg.update(3.0, 1.0, 2.0);
        let (loss, triplet, ce) = avg.means().unwrap();
        assert!((loss - 2.0).abs() < 1e-12);
        assert!((triplet - 0.7).abs() < 1e-12);
        assert!((ce - 1.3).abs() < 1e-12);
        assert_eq!(avg.count(), 2);

        avg.reset();
        assert_eq!(avg.count(), 0);
    }
}
