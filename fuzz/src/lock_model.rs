//! In-memory model of the robust lock protocol.
//!
//! Models what `PMutex` does on top of a robust pthread mutex: the raw mutex
//! can be free, held by a live owner, or held by a dead one, and the latched
//! `owner_died` flag sits next to it. Participants are numbered; any of them
//! can lock, unlock, die or reset in any order.

/// Number of participants in a fuzzed history.
pub const PARTICIPANTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Raw {
    Free,
    Held { owner: usize },
    HeldByDead { owner: usize },
}

/// What a lock attempt returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Locked,
    TimedOut,
    OwnerDied,
}

#[derive(Debug, Clone)]
pub struct LockModel {
    raw: Raw,
    owner_died: bool,
    alive: [bool; PARTICIPANTS],
}

impl Default for LockModel {
    fn default() -> Self {
        Self::new()
    }
}

impl LockModel {
    pub fn new() -> Self {
        Self {
            raw: Raw::Free,
            owner_died: false,
            alive: [true; PARTICIPANTS],
        }
    }

    pub fn raw(&self) -> Raw {
        self.raw
    }

    pub fn owner_died(&self) -> bool {
        self.owner_died
    }

    pub fn is_alive(&self, who: usize) -> bool {
        self.alive[who]
    }

    pub fn holder(&self) -> Option<usize> {
        match self.raw {
            Raw::Held { owner } => Some(owner),
            _ => None,
        }
    }

    /// A bounded lock attempt by `who`. Returns `None` if `who` is dead or
    /// already holds the lock (the real lock panics on relock).
    pub fn lock(&mut self, who: usize) -> Option<Outcome> {
        if !self.alive[who] || self.holder() == Some(who) {
            return None;
        }
        Some(match self.raw {
            Raw::Held { .. } => Outcome::TimedOut,
            Raw::HeldByDead { .. } => {
                // EOWNERDEAD: latch, make consistent, release.
                self.owner_died = true;
                self.raw = Raw::Free;
                Outcome::OwnerDied
            }
            Raw::Free if self.owner_died => Outcome::OwnerDied,
            Raw::Free => {
                self.raw = Raw::Held { owner: who };
                Outcome::Locked
            }
        })
    }

    pub fn unlock(&mut self, who: usize) -> bool {
        if self.holder() == Some(who) {
            self.raw = Raw::Free;
            true
        } else {
            false
        }
    }

    /// `who` terminates. A held lock passes to the dead state.
    pub fn die(&mut self, who: usize) {
        if !self.alive[who] {
            return;
        }
        self.alive[who] = false;
        if self.holder() == Some(who) {
            self.raw = Raw::HeldByDead { owner: who };
        }
    }

    /// A dead participant's slot is taken by a fresh process.
    pub fn respawn(&mut self, who: usize) {
        self.alive[who] = true;
    }

    pub fn reset(&mut self) {
        self.owner_died = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    Lock(usize),
    Unlock(usize),
    Die(usize),
    Respawn(usize),
    /// The writer's recovery path: lock, and reset on `OwnerDied`.
    WriterLock(usize),
}

/// Run `ops` and check the protocol's invariants after every step.
pub fn execute_and_verify(ops: &[LockOp]) -> Result<(), String> {
    let mut m = LockModel::new();

    for (step, op) in ops.iter().enumerate() {
        let before = m.clone();
        match *op {
            LockOp::Lock(who) => {
                if let Some(outcome) = m.lock(who) {
                    check_outcome(&before, &m, who, outcome, step)?;
                }
            }
            LockOp::WriterLock(who) => {
                if let Some(outcome) = m.lock(who) {
                    check_outcome(&before, &m, who, outcome, step)?;
                    if outcome == Outcome::OwnerDied {
                        m.reset();
                        if m.owner_died() {
                            return Err(format!("step {step}: reset left owner_died set"));
                        }
                    }
                }
            }
            LockOp::Unlock(who) => {
                m.unlock(who);
            }
            LockOp::Die(who) => m.die(who),
            LockOp::Respawn(who) => m.respawn(who),
        }

        if let Some(owner) = m.holder() {
            if !m.is_alive(owner) {
                return Err(format!("step {step}: dead participant {owner} still holds the lock"));
            }
        }
    }

    verify_never_wedged(&m)
}

fn check_outcome(
    before: &LockModel,
    after: &LockModel,
    who: usize,
    outcome: Outcome,
    step: usize,
) -> Result<(), String> {
    match outcome {
        Outcome::Locked => {
            if before.owner_died() {
                return Err(format!("step {step}: locked while owner-died was latched"));
            }
            if after.holder() != Some(who) {
                return Err(format!("step {step}: Locked but {who} is not the holder"));
            }
        }
        Outcome::OwnerDied => {
            if after.holder() == Some(who) {
                return Err(format!("step {step}: OwnerDied left {who} holding the lock"));
            }
            if !after.owner_died() {
                return Err(format!("step {step}: OwnerDied reported but not latched"));
            }
        }
        Outcome::TimedOut => {
            if after.raw() != before.raw() {
                return Err(format!("step {step}: timeout changed the lock state"));
            }
            if !matches!(before.raw(), Raw::Held { .. }) {
                return Err(format!("step {step}: timed out on a lock nobody live holds"));
            }
        }
    }
    Ok(())
}

/// Once the live holder lets go and someone resets, anyone can lock.
fn verify_never_wedged(m: &LockModel) -> Result<(), String> {
    let mut m = m.clone();
    if let Some(owner) = m.holder() {
        m.unlock(owner);
    }
    let who = (0..PARTICIPANTS).find(|&p| m.is_alive(p)).unwrap_or_else(|| {
        m.respawn(0);
        0
    });
    let first = m.lock(who);
    if first == Some(Outcome::OwnerDied) {
        m.reset();
    } else if first == Some(Outcome::Locked) {
        m.unlock(who);
    }
    match m.lock(who) {
        Some(Outcome::Locked) => Ok(()),
        other => Err(format!("lock wedged after recovery: {other:?} ({m:?})")),
    }
}
