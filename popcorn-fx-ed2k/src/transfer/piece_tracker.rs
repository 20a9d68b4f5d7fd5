use bit_vec::BitVec;
use log::trace;
use std::fmt::Debug;

/// The index of a piece within a transfer.
pub type PieceIndex = usize;

/// A [PieceTracker] factory which creates a new tracker for each downloading transfer.
pub type PieceTrackerFactory = fn() -> Box<dyn PieceTracker>;

/// Tracks the completion state of the pieces of a transfer.
pub trait PieceTracker: Debug + Send + Sync {
    /// Initialize the tracker for the given piece geometry.
    /// Any previously tracked state is discarded.
    fn init(&mut self, blocks_per_piece: usize, blocks_in_last_piece: usize, num_pieces: usize);

    /// Mark the given piece as owned.
    fn we_have(&mut self, index: PieceIndex);

    /// Check if all data of the given piece has been received and written.
    fn is_piece_finished(&self, index: PieceIndex) -> bool;

    /// Restore the given piece to the pending state so it can be requested again.
    fn restore_piece(&mut self, index: PieceIndex);

    /// Mark all blocks of the given piece as written.
    fn mark_finished(&mut self, index: PieceIndex);

    /// Check if the given piece is owned.
    fn have_piece(&self, index: PieceIndex) -> bool;

    /// Get the number of owned pieces.
    fn num_have(&self) -> usize;

    /// Get the total number of pieces.
    fn num_pieces(&self) -> usize;
}

/// The default piece tracker which keeps the piece state within bitmaps.
#[derive(Debug, Default, Clone)]
pub struct PiecePicker {
    /// The pieces of which all blocks have been written, but not yet verified
    finished: BitVec,
    /// The verified pieces
    have: BitVec,
    num_have: usize,
}

impl PiecePicker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PieceTracker for PiecePicker {
    fn init(&mut self, blocks_per_piece: usize, _: usize, num_pieces: usize) {
        trace!(
            "Piece picker is initializing {} pieces ({} blocks per piece)",
            num_pieces,
            blocks_per_piece
        );
        self.finished = BitVec::from_elem(num_pieces, false);
        self.have = BitVec::from_elem(num_pieces, false);
        self.num_have = 0;
    }

    fn we_have(&mut self, index: PieceIndex) {
        if index >= self.have.len() || self.have_piece(index) {
            return;
        }

        self.have.set(index, true);
        self.finished.set(index, false);
        self.num_have += 1;
    }

    fn is_piece_finished(&self, index: PieceIndex) -> bool {
        self.have_piece(index) || self.finished.get(index).unwrap_or_default()
    }

    fn restore_piece(&mut self, index: PieceIndex) {
        if index < self.finished.len() {
            trace!("Piece picker is restoring piece {}", index);
            self.finished.set(index, false);
        }
    }

    fn mark_finished(&mut self, index: PieceIndex) {
        if index < self.finished.len() && !self.have_piece(index) {
            self.finished.set(index, true);
        }
    }

    fn have_piece(&self, index: PieceIndex) -> bool {
        self.have.get(index).unwrap_or_default()
    }

    fn num_have(&self) -> usize {
        self.num_have
    }

    fn num_pieces(&self) -> usize {
        self.have.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        let mut picker = PiecePicker::new();

        picker.init(1, 1, 4);

        assert_eq!(4, picker.num_pieces());
        assert_eq!(0, picker.num_have());
        assert_eq!(false, picker.is_piece_finished(0));
    }

    #[test]
    fn test_we_have() {
        let mut picker = PiecePicker::new();
        picker.init(1, 1, 4);

        picker.mark_finished(2);
        picker.we_have(2);
        picker.we_have(2);

        assert_eq!(1, picker.num_have(), "expected the piece to be counted once");
        assert_eq!(true, picker.have_piece(2));
        assert_eq!(true, picker.is_piece_finished(2));
    }

    #[test]
    fn test_restore_piece() {
        let mut picker = PiecePicker::new();
        picker.init(1, 1, 2);
        picker.mark_finished(1);
        assert_eq!(true, picker.is_piece_finished(1));

        picker.restore_piece(1);

        assert_eq!(false, picker.is_piece_finished(1));
        assert_eq!(0, picker.num_have());
    }

    #[test]
    fn test_out_of_bounds() {
        let mut picker = PiecePicker::new();
        picker.init(1, 1, 2);

        picker.mark_finished(5);
        picker.we_have(5);
        picker.restore_piece(5);

        assert_eq!(false, picker.is_piece_finished(5));
        assert_eq!(0, picker.num_have());
    }
}
