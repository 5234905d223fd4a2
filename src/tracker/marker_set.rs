//! Sparse set of live markers, each holding a unique small identifier.
//!
//! Identifiers `1..=capacity` start in an ordered free pool. Adding a marker
//! pops the front of the pool; removing one pushes its identifier to the back,
//! so recently freed identifiers are reused last.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::geometry::PixelPoint;

/// Marker identifier, `1..=255`.
pub type MarkerId = u8;

/// A tracked marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Marker {
    /// Identifier, stable for the marker's lifetime.
    pub id: MarkerId,
    /// Last matched pixel position.
    pub position: PixelPoint,
    /// Time of first detection.
    pub first_seen: Instant,
    /// Time of the most recent match.
    pub last_seen: Instant,
}

impl Marker {
    /// How long the marker has been continuously tracked.
    pub fn age(&self) -> Duration {
        self.last_seen.saturating_duration_since(self.first_seen)
    }
}

/// Live markers plus the pool of free identifiers.
#[derive(Clone, Debug)]
pub struct MarkerSet {
    available: VecDeque<MarkerId>,
    markers: BTreeMap<MarkerId, Marker>,
}

impl MarkerSet {
    /// Empty set with identifiers `1..=capacity`.
    pub fn new(capacity: u8) -> Self {
        Self {
            available: (1..=capacity).collect(),
            markers: BTreeMap::new(),
        }
    }

    /// Creates a marker at `position` and returns its identifier.
    ///
    /// Returns `None` when every identifier is in use.
    pub fn add_marker(&mut self, position: PixelPoint, now: Instant) -> Option<MarkerId> {
        let id = self.available.pop_front()?;
        self.markers.insert(
            id,
            Marker {
                id,
                position,
                first_seen: now,
                last_seen: now,
            },
        );
        Some(id)
    }

    /// Deletes a marker and returns its identifier to the pool.
    pub fn remove_marker(&mut self, id: MarkerId) -> Option<Marker> {
        let marker = self.markers.remove(&id)?;
        self.available.push_back(id);
        Some(marker)
    }

    /// Looks up a live marker.
    pub fn get(&self, id: MarkerId) -> Option<&Marker> {
        self.markers.get(&id)
    }

    /// Mutable access to a live marker.
    pub fn get_mut(&mut self, id: MarkerId) -> Option<&mut Marker> {
        self.markers.get_mut(&id)
    }

    /// Live markers in identifier order.
    pub fn markers(&self) -> impl Iterator<Item = &Marker> {
        self.markers.values()
    }

    /// Nearest live marker whose squared distance to `point` is strictly below
    /// `threshold_sq`. Equal distances resolve to the lowest identifier.
    pub fn find_closest_marker(&self, point: PixelPoint, threshold_sq: f64) -> Option<MarkerId> {
        let mut closest: Option<(MarkerId, f64)> = None;
        for marker in self.markers.values() {
            let distance = marker.position.distance_sq(&point);
            if distance >= threshold_sq {
                continue;
            }
            if closest.map_or(true, |(_, best)| distance < best) {
                closest = Some((marker.id, distance));
            }
        }
        closest.map(|(id, _)| id)
    }

    /// Number of live markers.
    pub fn len(&self) -> usize {
        self.markers.len()
    }

    /// True if no markers are live.
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Number of free identifiers.
    pub fn available(&self) -> usize {
        self.available.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identifiers_start_at_one() {
        let mut set = MarkerSet::new(3);
        let now = Instant::now();
        assert_eq!(set.add_marker(PixelPoint::new(0, 0), now), Some(1));
        assert_eq!(set.add_marker(PixelPoint::new(1, 0), now), Some(2));
        assert_eq!(set.add_marker(PixelPoint::new(2, 0), now), Some(3));
        assert_eq!(set.add_marker(PixelPoint::new(3, 0), now), None);
        assert_eq!(set.available(), 0);
    }

    #[test]
    fn test_full_pool_ids_are_unique() {
        let mut set = MarkerSet::new(255);
        let now = Instant::now();
        let ids: HashSet<MarkerId> = (0..255)
            .map(|i| set.add_marker(PixelPoint::new(i, i), now).unwrap())
            .collect();
        assert_eq!(ids.len(), 255);
        assert!(!ids.contains(&0));
    }

    #[test]
    fn test_removed_id_reused_without_collision() {
        let mut set = MarkerSet::new(4);
        let now = Instant::now();
        for i in 0..4 {
            set.add_marker(PixelPoint::new(i * 10, 0), now);
        }

        let removed = set.remove_marker(2).unwrap();
        assert_eq!(removed.id, 2);
        assert!(set.get(2).is_none());

        let new_id = set.add_marker(PixelPoint::new(99, 99), now).unwrap();
        assert_eq!(new_id, 2);
        let live: Vec<MarkerId> = set.markers().map(|m| m.id).collect();
        assert_eq!(live, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_freed_ids_go_to_back_of_pool() {
        let mut set = MarkerSet::new(4);
        let now = Instant::now();
        let a = set.add_marker(PixelPoint::new(0, 0), now).unwrap();
        set.remove_marker(a);
        assert_eq!(set.add_marker(PixelPoint::new(0, 0), now), Some(2));
    }

    #[test]
    fn test_double_remove_does_not_duplicate_id() {
        let mut set = MarkerSet::new(2);
        let now = Instant::now();
        let id = set.add_marker(PixelPoint::new(0, 0), now).unwrap();
        assert!(set.remove_marker(id).is_some());
        assert!(set.remove_marker(id).is_none());
        assert_eq!(set.available(), 2);
    }

    #[test]
    fn test_find_closest_within_threshold() {
        let mut set = MarkerSet::new(8);
        let now = Instant::now();
        let id = set.add_marker(PixelPoint::new(100, 100), now).unwrap();

        assert_eq!(set.find_closest_marker(PixelPoint::new(105, 102), 20_000.0), Some(id));
        assert_eq!(set.find_closest_marker(PixelPoint::new(500, 500), 20_000.0), None);
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut set = MarkerSet::new(8);
        let now = Instant::now();
        set.add_marker(PixelPoint::new(0, 0), now);
        // distance² = 100
        assert_eq!(set.find_closest_marker(PixelPoint::new(10, 0), 100.0), None);
        assert_eq!(set.find_closest_marker(PixelPoint::new(10, 0), 100.5), Some(1));
    }

    #[test]
    fn test_nearest_wins_and_ties_go_to_lowest_id() {
        let mut set = MarkerSet::new(8);
        let now = Instant::now();
        let left = set.add_marker(PixelPoint::new(0, 0), now).unwrap();
        let right = set.add_marker(PixelPoint::new(20, 0), now).unwrap();

        assert_eq!(set.find_closest_marker(PixelPoint::new(15, 0), 1000.0), Some(right));
        assert_eq!(set.find_closest_marker(PixelPoint::new(10, 0), 1000.0), Some(left));
    }
}
