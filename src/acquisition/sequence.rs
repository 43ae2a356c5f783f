//! Physical trigger order of frames within an acquisition.

use crate::core::SequenceEvent;

/// Lazily yields [`SequenceEvent`]s in the order the camera produces frames:
/// timepoint-major, then slice, then camera channel.
#[derive(Debug, Clone)]
pub struct SequenceOrder {
    num_timepoints: u32,
    num_slices: u32,
    num_channels: u32,
    next: u64,
    total: u64,
}

impl SequenceOrder {
    /// Order for `num_timepoints` volumes of `num_slices` slices on `num_channels` cameras.
    pub fn new(num_timepoints: u32, num_slices: u32, num_channels: u32) -> Self {
        let num_channels = num_channels.max(1);
        Self {
            num_timepoints,
            num_slices,
            num_channels,
            next: 0,
            total: u64::from(num_timepoints) * u64::from(num_slices) * u64::from(num_channels),
        }
    }
}

impl Iterator for SequenceOrder {
    type Item = SequenceEvent;

    fn next(&mut self) -> Option<SequenceEvent> {
        if self.next >= self.total {
            return None;
        }
        let i = self.next;
        self.next += 1;

        let channels = u64::from(self.num_channels);
        let per_volume = u64::from(self.num_slices) * channels;
        Some(SequenceEvent {
            timepoint: (i / per_volume) as u32,
            z_index: ((i % per_volume) / channels) as u32,
            channel: (i % channels) as u32,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.total - self.next) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for SequenceOrder {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_is_innermost() {
        let events: Vec<_> = SequenceOrder::new(2, 2, 2)
            .map(|e| (e.timepoint, e.z_index, e.channel))
            .collect();
        assert_eq!(
            events,
            vec![
                (0, 0, 0),
                (0, 0, 1),
                (0, 1, 0),
                (0, 1, 1),
                (1, 0, 0),
                (1, 0, 1),
                (1, 1, 0),
                (1, 1, 1),
            ]
        );
    }

    #[test]
    fn test_length_matches_total_images() {
        let order = SequenceOrder::new(3, 10, 1);
        assert_eq!(order.len(), 30);
        assert_eq!(order.last().map(|e| (e.timepoint, e.z_index)), Some((2, 9)));
    }

    #[test]
    fn test_zero_channels_treated_as_one() {
        assert_eq!(SequenceOrder::new(1, 4, 0).count(), 4);
    }
}
