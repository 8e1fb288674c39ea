/// Piece-priority collaborator. The selection heuristic lives outside the
/// engine; schedulers only drive this interface.
pub trait PiecePicker {
    /// Next piece to request among those `want` accepts, or `None`.
    /// `preferred` is set when the caller is re-placing work it already
    /// committed to (redistribution after a choke, disconnect or flunk).
    fn next(&mut self, want: &dyn Fn(u32) -> bool, preferred: bool) -> Option<u32>;

    /// A scheduler committed to requesting this piece.
    fn requested(&mut self, piece: u32, preferred: bool);

    /// The piece verified and will never be requested again.
    fn complete(&mut self, piece: u32);

    /// Deprioritize a piece that came back corrupt.
    fn bump(&mut self, piece: u32);

    /// A connected peer announced the piece.
    fn got_have(&mut self, piece: u32);

    /// A peer holding the piece went away.
    fn lost_have(&mut self, piece: u32);

    fn is_complete(&self) -> bool;
}
