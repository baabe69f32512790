//! XOR-merges contributions from same-group devices before they reach
//! the [`Pool`].

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::pool::Pool;

pub const MAX_MEMBERS: u32 = 32;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("group is saturated: all {MAX_MEMBERS} membership slots are in use")]
pub struct GroupSaturated;

struct GroupState {
    members: u32,
    contributed: u32,
    buffer: Vec<u8>,
    has_data: bool,
}

/// A group of ID 0, or with a single member, is a pass-through directly
/// to the pool; everything else XOR-accumulates until every member slot
/// has contributed since the last flush.
pub struct Group {
    id: u32,
    size: usize,
    state: Mutex<GroupState>,
    pool: Arc<Pool>,
}

impl Group {
    pub fn new(id: u32, size: usize, pool: Arc<Pool>) -> Self {
        Self {
            id,
            size,
            state: Mutex::new(GroupState { members: 0, contributed: 0, buffer: vec![0u8; size], has_data: false }),
            pool,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Allocate a unique power-of-two membership bit. Errors once all 32
    /// slots are taken.
    pub fn next_mask(&self) -> Result<u32, GroupSaturated> {
        let mut state = self.state.lock();
        let free = !state.members;
        if free == 0 {
            return Err(GroupSaturated);
        }
        let bit = free & free.wrapping_neg();
        state.members |= bit;
        Ok(bit)
    }

    /// Release a membership slot, e.g. on worker teardown, zeroing that
    /// slot's bit out of the pending-contribution set too.
    pub fn release_mask(&self, mask: u32) {
        let mut state = self.state.lock();
        state.members &= !mask;
        state.contributed &= !mask;
    }

    pub fn add_entropy(&self, mask: u32, buf: &[u8]) {
        let mut state = self.state.lock();

        if self.id == 0 || state.members.count_ones() <= 1 {
            drop(state);
            self.pool.add_entropy(buf);
            return;
        }

        if !state.has_data {
            state.buffer.fill(0);
            let n = buf.len().min(self.size);
            state.buffer[..n].copy_from_slice(&buf[..n]);
            state.has_data = true;
        } else {
            for (b, x) in state.buffer.iter_mut().zip(buf.iter()) {
                *b ^= x;
            }
        }
        state.contributed |= mask;

        if state.contributed == state.members {
            let flushed = std::mem::replace(&mut state.buffer, vec![0u8; self.size]);
            state.has_data = false;
            state.contributed = 0;
            drop(state);
            self.pool.add_entropy(&flushed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_member_group_passes_through_to_pool() {
        let pool = Arc::new(Pool::new(64));
        let group = Group::new(1, 64, pool.clone());
        let mask = group.next_mask().unwrap();
        group.add_entropy(mask, &[0xAAu8; 64]);
        assert_eq!(pool.fill(), 64);
    }

    #[test]
    fn group_zero_is_always_pass_through() {
        let pool = Arc::new(Pool::new(64));
        let group = Group::new(0, 64, pool.clone());
        let mask_a = group.next_mask().unwrap();
        let _mask_b = group.next_mask().unwrap();
        group.add_entropy(mask_a, &[1u8; 64]);
        assert_eq!(pool.fill(), 64, "group 0 bypasses membership accounting entirely");
    }

    #[test]
    fn flushes_xor_of_all_members_exactly_once_per_round() {
        let pool = Arc::new(Pool::new(4));
        let group = Group::new(7, 4, pool.clone());
        let a = group.next_mask().unwrap();
        let b = group.next_mask().unwrap();

        group.add_entropy(a, &[0x0F, 0x0F, 0x0F, 0x0F]);
        assert_eq!(pool.fill(), 0, "must not flush until every member has contributed");

        group.add_entropy(b, &[0xF0, 0xF0, 0xF0, 0xF0]);
        assert_eq!(pool.fill(), 4);
        let state = group.state.lock();
        assert_eq!(state.contributed, 0, "contributed set resets after flush");
    }

    #[test]
    fn next_mask_is_unique_and_saturates_at_32() {
        let pool = Arc::new(Pool::new(4));
        let group = Group::new(3, 4, pool);
        let mut seen = 0u32;
        for _ in 0..MAX_MEMBERS {
            let m = group.next_mask().unwrap();
            assert_eq!(seen & m, 0, "masks must never overlap");
            seen |= m;
        }
        assert!(group.next_mask().is_err());
    }
}
