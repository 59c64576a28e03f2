//! In-memory model of the generational semaphore.
//!
//! The model keeps the count, the current generation and every outstanding
//! token. Holders may post, post late, or vanish without posting; waits that
//! find no count "time out" and reclaim.

use vfb_ipc::Generation;

/// Holders that can own a token at once.
pub const MAX_HOLDERS: usize = 8;

#[derive(Debug, Clone)]
pub struct SemModel {
    initial: u32,
    count: i64,
    generation: Generation,
    /// Tokens held, by holder index.
    tokens: [Option<Generation>; MAX_HOLDERS],
    /// Current-generation slots whose holders vanished without posting.
    leaked: i64,
}

impl SemModel {
    pub fn new(initial: u32) -> Self {
        Self {
            initial,
            count: initial as i64,
            generation: Generation::new(0),
            tokens: [None; MAX_HOLDERS],
            leaked: 0,
        }
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// `who` waits. Takes a count if one is free, otherwise times out and
    /// reclaims. Returns `None` if `who` already holds a token.
    pub fn wait(&mut self, who: usize) -> Option<Generation> {
        if self.tokens[who].is_some() {
            return None;
        }
        let g = if self.count > 0 {
            self.count -= 1;
            self.generation
        } else {
            self.generation = self.generation.next();
            self.count = (self.initial as i64 - 1).max(0);
            self.leaked = 0;
            self.generation
        };
        self.tokens[who] = Some(g);
        Some(g)
    }

    /// `who` posts its token. Returns whether the post was honored.
    pub fn post(&mut self, who: usize) -> Option<bool> {
        let g = self.tokens[who].take()?;
        if g == self.generation {
            self.count += 1;
            Some(true)
        } else {
            Some(false)
        }
    }

    /// `who` disappears with its token.
    pub fn vanish(&mut self, who: usize) {
        if let Some(g) = self.tokens[who].take() {
            if g == self.generation {
                self.leaked += 1;
            }
        }
    }

    /// Outstanding tokens that still count against the current generation.
    pub fn current_holders(&self) -> i64 {
        self.tokens
            .iter()
            .filter(|t| **t == Some(self.generation))
            .count() as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemOp {
    Wait(usize),
    Post(usize),
    Vanish(usize),
}

/// Run `ops` from a fresh semaphore and check the accounting after each step.
pub fn execute_and_verify(initial: u32, ops: &[SemOp]) -> Result<(), String> {
    let mut m = SemModel::new(initial);
    let initial = initial as i64;

    for (step, op) in ops.iter().enumerate() {
        let before_gen = m.generation();
        match *op {
            SemOp::Wait(who) => {
                if let Some(g) = m.wait(who) {
                    if g != m.generation() {
                        return Err(format!("step {step}: wait returned stale {g}"));
                    }
                    if g < before_gen {
                        return Err(format!("step {step}: generation went backwards"));
                    }
                }
            }
            SemOp::Post(who) => {
                m.post(who);
            }
            SemOp::Vanish(who) => m.vanish(who),
        }

        if m.count() < 0 {
            return Err(format!("step {step}: negative count {}", m.count()));
        }
        // Slots are conserved within a generation: free + held + leaked.
        let accounted = m.count() + m.current_holders() + m.leaked;
        if initial > 0 && accounted != initial {
            return Err(format!(
                "step {step}: {} free + {} held + {} leaked != {initial} (after {op:?})",
                m.count(),
                m.current_holders(),
                m.leaked
            ));
        }
        if m.count() > initial {
            return Err(format!("step {step}: over-credited to {}", m.count()));
        }
    }
    Ok(())
}
