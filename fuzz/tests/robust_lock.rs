//! Bolero fuzzer for the robust lock protocol.
//!
//! Properties tested:
//! - A caller that sees OwnerDied holds nothing
//! - A dead participant never stays the holder
//! - OwnerDied is latched until reset, and Locked is never returned meanwhile
//! - After the holder lets go and a reset runs, the lock is usable again

use bolero::check;
use vfb_fuzz::lock_model::{execute_and_verify, LockOp, PARTICIPANTS};

#[derive(Debug, Clone, bolero::TypeGenerator)]
enum Op {
    Lock(u8),
    Unlock(u8),
    Die(u8),
    Respawn(u8),
    WriterLock(u8),
}

impl Op {
    fn to_lock_op(&self) -> LockOp {
        let who = |p: &u8| *p as usize % PARTICIPANTS;
        match self {
            Op::Lock(p) => LockOp::Lock(who(p)),
            Op::Unlock(p) => LockOp::Unlock(who(p)),
            Op::Die(p) => LockOp::Die(who(p)),
            Op::Respawn(p) => LockOp::Respawn(who(p)),
            Op::WriterLock(p) => LockOp::WriterLock(who(p)),
        }
    }
}

fn main() {
    check!().with_type::<Vec<Op>>().for_each(|ops| {
        let ops: Vec<LockOp> = ops.iter().map(Op::to_lock_op).collect();
        if let Err(e) = execute_and_verify(&ops) {
            panic!("Invariant violated: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use vfb_fuzz::lock_model::{execute_and_verify, LockOp};

    #[test]
    fn every_participant_dies_holding_in_turn() {
        let mut ops = Vec::new();
        for p in 0..4 {
            ops.extend([LockOp::WriterLock(p), LockOp::Die(p), LockOp::Respawn(p)]);
        }
        execute_and_verify(&ops).unwrap();
    }
}
