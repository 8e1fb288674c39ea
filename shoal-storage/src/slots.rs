/// Occupancy of one physical slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// No bytes claimed on disk.
    Unallocated,
    /// Bytes exist on disk but hold no piece worth keeping.
    Allocated,
    /// Slot currently holds this piece's bytes.
    Held(u32),
}

/// The placement bijection: `placement[piece] -> slot` and
/// `inverse[slot] -> state`. Occupied slots and placed pieces correspond
/// one-to-one; every mutation re-checks the invariant.
pub struct SlotTable {
    placement: Vec<Option<u32>>,
    inverse: Vec<SlotState>,
}

impl SlotTable {
    pub fn new(n: usize) -> SlotTable {
        SlotTable {
            placement: vec![None; n],
            inverse: vec![SlotState::Unallocated; n],
        }
    }

    pub fn len(&self) -> usize {
        self.inverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inverse.is_empty()
    }

    pub fn slot_of(&self, piece: u32) -> Option<u32> {
        self.placement[piece as usize]
    }

    pub fn state(&self, slot: u32) -> SlotState {
        self.inverse[slot as usize]
    }

    pub fn states(&self) -> impl Iterator<Item = (u32, SlotState)> + '_ {
        self.inverse
            .iter()
            .enumerate()
            .map(|(slot, state)| (slot as u32, *state))
    }

    /// Mark a slot's bytes as present without binding a piece to them.
    pub fn mark_allocated(&mut self, slot: u32) {
        debug_assert!(!matches!(self.inverse[slot as usize], SlotState::Held(_)));
        self.inverse[slot as usize] = SlotState::Allocated;
        self.check();
    }

    /// Bind a piece to a free slot.
    pub fn claim(&mut self, slot: u32, piece: u32) {
        debug_assert!(self.placement[piece as usize].is_none());
        debug_assert!(!matches!(self.inverse[slot as usize], SlotState::Held(_)));
        self.placement[piece as usize] = Some(slot);
        self.inverse[slot as usize] = SlotState::Held(piece);
        self.check();
    }

    /// Unbind whatever piece a slot holds, leaving the bytes allocated.
    pub fn vacate(&mut self, slot: u32) -> u32 {
        let piece = match self.inverse[slot as usize] {
            SlotState::Held(piece) => piece,
            state => panic!("vacate of {:?} slot {}", state, slot),
        };
        self.placement[piece as usize] = None;
        self.inverse[slot as usize] = SlotState::Allocated;
        self.check();
        piece
    }

    /// Move a placed piece to a free slot. The caller moves the bytes.
    pub fn relocate(&mut self, piece: u32, to_slot: u32) {
        let from = self.placement[piece as usize].expect("relocate of unplaced piece");
        self.vacate(from);
        self.claim(to_slot, piece);
    }

    /// Lowest-indexed slot not holding a piece and accepted by `fits`.
    pub fn lowest_free(&self, fits: impl Fn(u32) -> bool) -> Option<u32> {
        self.inverse
            .iter()
            .enumerate()
            .find(|(slot, state)| {
                !matches!(state, SlotState::Held(_)) && fits(*slot as u32)
            })
            .map(|(slot, _)| slot as u32)
    }

    fn check(&self) {
        #[cfg(debug_assertions)]
        {
            for (piece, slot) in self.placement.iter().enumerate() {
                if let Some(slot) = slot {
                    assert_eq!(
                        self.inverse[*slot as usize],
                        SlotState::Held(piece as u32),
                        "placement[{}] = {} not mirrored",
                        piece,
                        slot
                    );
                }
            }
            for (slot, state) in self.inverse.iter().enumerate() {
                if let SlotState::Held(piece) = state {
                    assert_eq!(
                        self.placement[*piece as usize],
                        Some(slot as u32),
                        "inverse[{}] = {} not mirrored",
                        slot,
                        piece
                    );
                }
            }
        }
    }
}
