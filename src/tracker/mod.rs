//! Marker tracking.
//!
//! [`MarkerTracker`] turns per-frame blob detections into markers with stable
//! identifiers. It is pure and synchronous: the tracking task feeds it blobs
//! and frame timestamps, and the session reads snapshots of its markers.
//!
//! # Per-frame update
//!
//! 1. Expire every marker whose last match is at least `staleness` older than
//!    the frame.
//! 2. For each blob with area at or above `min_blob_area`, match its centroid
//!    to the nearest marker within `match_radius_sq`. A match moves the marker
//!    and refreshes `last_seen`; a miss creates a new marker.

mod marker_set;

use std::time::Duration;

use tokio::time::Instant;

use crate::camera::Blob;

pub use marker_set::{Marker, MarkerId, MarkerSet};

/// Matching and expiry parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerParams {
    /// Unmatched markers older than this are removed.
    pub staleness: Duration,
    /// Blobs smaller than this are ignored.
    pub min_blob_area: f64,
    /// Squared pixel radius for matching a blob to a marker.
    pub match_radius_sq: f64,
    /// Identifier pool size.
    pub max_markers: u8,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            staleness: Duration::from_millis(500),
            min_blob_area: 10.0,
            match_radius_sq: 20_000.0,
            max_markers: 255,
        }
    }
}

/// What one frame changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    /// Markers removed for staleness.
    pub expired: Vec<MarkerId>,
    /// Markers created this frame.
    pub added: Vec<MarkerId>,
    /// Matches against existing markers.
    pub matched: usize,
    /// Blobs below the area filter.
    pub filtered: usize,
    /// Blobs dropped because the identifier pool was empty.
    pub exhausted: usize,
}

/// Maintains the set of currently visible markers.
#[derive(Clone, Debug)]
pub struct MarkerTracker {
    markers: MarkerSet,
    params: TrackerParams,
}

impl MarkerTracker {
    /// Tracker with an empty marker set.
    pub fn new(params: TrackerParams) -> Self {
        Self {
            markers: MarkerSet::new(params.max_markers),
            params,
        }
    }

    /// Applies one frame of detections taken at `now`.
    pub fn update(&mut self, blobs: &[Blob], now: Instant) -> UpdateSummary {
        let mut summary = UpdateSummary::default();

        let stale: Vec<MarkerId> = self
            .markers
            .markers()
            .filter(|m| now.saturating_duration_since(m.last_seen) >= self.params.staleness)
            .map(|m| m.id)
            .collect();
        for id in stale {
            self.markers.remove_marker(id);
            summary.expired.push(id);
        }

        for blob in blobs {
            if blob.area < self.params.min_blob_area {
                summary.filtered += 1;
                continue;
            }

            let center = blob.centroid();
            let matched = self
                .markers
                .find_closest_marker(center, self.params.match_radius_sq)
                .and_then(|id| self.markers.get_mut(id));

            match matched {
                Some(marker) => {
                    marker.position = center;
                    marker.last_seen = now;
                    summary.matched += 1;
                }
                None => match self.markers.add_marker(center, now) {
                    Some(id) => {
                        tracing::debug!(marker_id = id, x = center.x, y = center.y, area = blob.area, "Found new marker");
                        summary.added.push(id);
                    }
                    None => summary.exhausted += 1,
                },
            }
        }

        if summary.exhausted > 0 {
            tracing::warn!(dropped = summary.exhausted, "Marker identifiers exhausted");
        }
        summary
    }

    /// Copy of every live marker, in identifier order.
    pub fn snapshot(&self) -> Vec<Marker> {
        self.markers.markers().copied().collect()
    }

    /// Removes every marker and refills the identifier pool in order, so the
    /// next marker gets id 1 again.
    pub fn clear(&mut self) {
        self.markers = MarkerSet::new(self.params.max_markers);
    }

    /// Read access to the underlying set.
    pub fn markers(&self) -> &MarkerSet {
        &self.markers
    }

    /// Active parameters.
    pub fn params(&self) -> &TrackerParams {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::BoundingBox;
    use crate::geometry::PixelPoint;

    fn blob_at(x: i32, y: i32, area: f64) -> Blob {
        Blob {
            area,
            bounds: BoundingBox {
                x: x - 2,
                y: y - 2,
                width: 5,
                height: 5,
            },
        }
    }

    #[test]
    fn test_nearby_detection_updates_existing_marker() {
        let mut tracker = MarkerTracker::new(TrackerParams::default());
        let t0 = Instant::now();

        let first = tracker.update(&[blob_at(100, 100, 25.0)], t0);
        assert_eq!(first.added.len(), 1);
        let id = first.added[0];

        let t1 = t0 + Duration::from_millis(30);
        let second = tracker.update(&[blob_at(105, 102, 25.0)], t1);
        assert!(second.added.is_empty());
        assert_eq!(second.matched, 1);

        let markers = tracker.snapshot();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].id, id);
        assert_eq!(markers[0].position, PixelPoint::new(105, 102));
        assert_eq!(markers[0].last_seen, t1);
        assert_eq!(markers[0].first_seen, t0);
    }

    #[test]
    fn test_distant_detection_creates_new_marker() {
        let mut tracker = MarkerTracker::new(TrackerParams::default());
        let t0 = Instant::now();
        tracker.update(&[blob_at(100, 100, 25.0)], t0);

        let summary = tracker.update(
            &[blob_at(100, 100, 25.0), blob_at(500, 500, 25.0)],
            t0 + Duration::from_millis(30),
        );
        assert_eq!(summary.added.len(), 1);
        assert_eq!(summary.matched, 1);

        let ids: Vec<MarkerId> = tracker.snapshot().iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn test_marker_expires_after_staleness_window() {
        let mut tracker = MarkerTracker::new(TrackerParams::default());
        let t0 = Instant::now();
        tracker.update(&[blob_at(50, 50, 25.0)], t0);

        let just_before = tracker.update(&[], t0 + Duration::from_millis(499));
        assert!(just_before.expired.is_empty());
        assert_eq!(tracker.snapshot().len(), 1);

        let at_window = tracker.update(&[], t0 + Duration::from_millis(500));
        assert_eq!(at_window.expired.len(), 1);
        assert!(tracker.snapshot().is_empty());
    }

    #[test]
    fn test_small_blobs_are_filtered() {
        let mut tracker = MarkerTracker::new(TrackerParams::default());
        let summary = tracker.update(&[blob_at(10, 10, 9.5), blob_at(40, 40, 10.0)], Instant::now());
        assert_eq!(summary.filtered, 1);
        assert_eq!(summary.added.len(), 1);
    }

    #[test]
    fn test_exhausted_pool_drops_new_blobs() {
        let params = TrackerParams {
            max_markers: 2,
            match_radius_sq: 100.0,
            ..TrackerParams::default()
        };
        let mut tracker = MarkerTracker::new(params);
        let blobs = [blob_at(0, 0, 20.0), blob_at(100, 0, 20.0), blob_at(200, 0, 20.0)];
        let summary = tracker.update(&blobs, Instant::now());

        assert_eq!(summary.added, vec![1, 2]);
        assert_eq!(summary.exhausted, 1);
        assert_eq!(tracker.snapshot().len(), 2);
    }

    #[test]
    fn test_expired_id_reused_without_collision() {
        let params = TrackerParams {
            match_radius_sq: 100.0,
            ..TrackerParams::default()
        };
        let mut tracker = MarkerTracker::new(params);
        let t0 = Instant::now();
        tracker.update(&[blob_at(0, 0, 20.0), blob_at(100, 0, 20.0)], t0);

        // Only the second marker keeps being seen.
        let t1 = t0 + Duration::from_millis(300);
        tracker.update(&[blob_at(100, 0, 20.0)], t1);
        let t2 = t0 + Duration::from_millis(600);
        let summary = tracker.update(&[blob_at(100, 0, 20.0), blob_at(300, 300, 20.0)], t2);

        assert_eq!(summary.expired, vec![1]);
        let ids: Vec<MarkerId> = tracker.snapshot().iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn test_clear_returns_ids() {
        let mut tracker = MarkerTracker::new(TrackerParams::default());
        tracker.update(&[blob_at(0, 0, 20.0), blob_at(400, 0, 20.0)], Instant::now());
        tracker.clear();
        assert!(tracker.markers().is_empty());
        assert_eq!(tracker.markers().available(), 255);
    }

    #[test]
    fn test_clear_restarts_identifiers() {
        let params = TrackerParams {
            match_radius_sq: 100.0,
            ..TrackerParams::default()
        };
        let mut tracker = MarkerTracker::new(params);
        let t0 = Instant::now();
        let first = tracker.update(&[blob_at(0, 0, 20.0), blob_at(100, 0, 20.0)], t0);
        assert_eq!(first.added, vec![1, 2]);

        tracker.clear();
        let again = tracker.update(&[blob_at(300, 300, 20.0)], t0 + Duration::from_millis(10));
        assert_eq!(again.added, vec![1]);
    }
}
