//! Catalog of small multithreaded programs with known heap bugs.
//!
//! Each scenario registers its threads (and any shared state) on a fresh
//! engine. Cross-unit state lives in the tracked heap, so rollback restores
//! it along with everything else.

use rollguard_engine::{DetectorError, Engine, ErrorKind, Flow, HeapPtr, ThreadContext, thread_body};
use serde::Serialize;

/// What a scenario should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Expectation {
    Clean,
    Detects {
        kind: ErrorKind,
        /// Offset from the allocation's user base, when it is known up front.
        offset: Option<i64>,
    },
}

pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    pub expect: Expectation,
    setup: fn(&mut Engine) -> Result<(), DetectorError>,
}

impl Scenario {
    pub fn install(&self, engine: &mut Engine) -> Result<(), DetectorError> {
        (self.setup)(engine)
    }
}

/// Requested size in the overflow scenario.
pub const OVERFLOW_SIZE: usize = 24;

pub const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "clean-counter",
        description: "three threads increment a shared counter under one lock",
        expect: Expectation::Clean,
        setup: clean_counter,
    },
    Scenario {
        name: "overflow",
        description: "allocate N bytes, write N+1, free",
        expect: Expectation::Detects {
            kind: ErrorKind::BufferOverflow,
            offset: Some(OVERFLOW_SIZE as i64),
        },
        setup: overflow,
    },
    Scenario {
        name: "use-after-free",
        description: "allocate, free, then write through the stale pointer",
        expect: Expectation::Detects {
            kind: ErrorKind::UseAfterFree,
            offset: Some(8),
        },
        setup: use_after_free,
    },
    Scenario {
        name: "double-free",
        description: "free the same pointer twice",
        expect: Expectation::Detects {
            kind: ErrorKind::DoubleFree,
            offset: None,
        },
        setup: double_free,
    },
    Scenario {
        name: "lock-order",
        description: "two threads take two locks in opposite order, one overflows afterwards",
        expect: Expectation::Detects {
            kind: ErrorKind::BufferOverflow,
            offset: Some(16),
        },
        setup: lock_order,
    },
    Scenario {
        name: "cross-thread-uaf",
        description: "one thread frees a shared buffer another thread still writes",
        expect: Expectation::Detects {
            kind: ErrorKind::UseAfterFree,
            offset: Some(0),
        },
        setup: cross_thread_uaf,
    },
];

#[must_use]
pub fn find(name: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.name == name)
}

fn load_ptr(ctx: &ThreadContext, slot: HeapPtr) -> Result<HeapPtr, DetectorError> {
    Ok(HeapPtr::from_addr(ctx.read_u64(slot)? as usize))
}

fn clean_counter(engine: &mut Engine) -> Result<(), DetectorError> {
    let counter = engine.alloc_global(8)?;
    let m = engine.mutex();
    for _ in 0..3 {
        let m = m.clone();
        engine.add_thread(thread_body(move |ctx, unit| {
            if unit == 16 {
                return Ok(Flow::Done);
            }
            ctx.lock(&m)?;
            let v = ctx.read_u64(counter)?;
            ctx.write_u64(counter, v + 1)?;
            ctx.unlock(&m)?;
            let tmp = ctx.calloc(4, 8)?;
            let tmp = ctx.realloc(Some(tmp), 64)?;
            ctx.free(tmp)?;
            Ok(Flow::Continue)
        }))?;
    }
    Ok(())
}

fn overflow(engine: &mut Engine) -> Result<(), DetectorError> {
    let slot = engine.alloc_global(8)?;
    engine.add_thread(thread_body(move |ctx, unit| match unit {
        0 => {
            let p = ctx.malloc(OVERFLOW_SIZE)?;
            ctx.write_u64(slot, p.addr() as u64)?;
            Ok(Flow::Continue)
        }
        1 => {
            ctx.fill(load_ptr(ctx, slot)?, b'A', OVERFLOW_SIZE + 1)?;
            Ok(Flow::Continue)
        }
        2 => {
            ctx.free(load_ptr(ctx, slot)?)?;
            Ok(Flow::Continue)
        }
        _ => Ok(Flow::Done),
    }))?;
    Ok(())
}

fn use_after_free(engine: &mut Engine) -> Result<(), DetectorError> {
    let slot = engine.alloc_global(8)?;
    engine.add_thread(thread_body(move |ctx, unit| match unit {
        0 => {
            let p = ctx.malloc(64)?;
            ctx.write_u64(slot, p.addr() as u64)?;
            Ok(Flow::Continue)
        }
        1 => {
            ctx.free(load_ptr(ctx, slot)?)?;
            Ok(Flow::Continue)
        }
        2 => {
            ctx.write_u64(load_ptr(ctx, slot)?.offset(8), 0xBAD)?;
            Ok(Flow::Continue)
        }
        _ => Ok(Flow::Done),
    }))?;
    Ok(())
}

fn double_free(engine: &mut Engine) -> Result<(), DetectorError> {
    let slot = engine.alloc_global(8)?;
    engine.add_thread(thread_body(move |ctx, unit| match unit {
        0 => {
            let p = ctx.malloc(32)?;
            ctx.write_u64(slot, p.addr() as u64)?;
            Ok(Flow::Continue)
        }
        1 | 2 => {
            ctx.free(load_ptr(ctx, slot)?)?;
            Ok(Flow::Continue)
        }
        _ => Ok(Flow::Done),
    }))?;
    Ok(())
}

fn lock_order(engine: &mut Engine) -> Result<(), DetectorError> {
    let shared = engine.alloc_global(16)?;
    let a = engine.mutex();
    let b = engine.mutex();
    for tid in 0..2u64 {
        let (first, second) = if tid == 0 {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        };
        engine.add_thread(thread_body(move |ctx, unit| {
            if unit == 12 {
                return Ok(Flow::Done);
            }
            // One lock at a time, so opposite orders cannot deadlock.
            ctx.lock(&first)?;
            let v = ctx.read_u64(shared)?;
            ctx.write_u64(shared, v + tid + 1)?;
            ctx.unlock(&first)?;
            ctx.lock(&second)?;
            let v = ctx.read_u64(shared.offset(8))?;
            ctx.write_u64(shared.offset(8), v * 3 + tid)?;
            ctx.unlock(&second)?;
            if tid == 1 && unit == 9 {
                let p = ctx.malloc(16)?;
                ctx.write(p, &[0x5C; 17])?;
            }
            Ok(Flow::Continue)
        }))?;
    }
    Ok(())
}

fn cross_thread_uaf(engine: &mut Engine) -> Result<(), DetectorError> {
    let slot = engine.alloc_global(8)?;
    let m = engine.mutex();
    let barrier = engine.barrier(2);
    {
        let (m, barrier) = (m.clone(), barrier.clone());
        engine.add_thread(thread_body(move |ctx, unit| match unit {
            0 => {
                ctx.lock(&m)?;
                let p = ctx.malloc(48)?;
                ctx.write_u64(slot, p.addr() as u64)?;
                ctx.unlock(&m)?;
                ctx.barrier_wait(&barrier)?;
                Ok(Flow::Continue)
            }
            1 => {
                ctx.barrier_wait(&barrier)?;
                ctx.lock(&m)?;
                ctx.free(load_ptr(ctx, slot)?)?;
                ctx.unlock(&m)?;
                ctx.barrier_wait(&barrier)?;
                Ok(Flow::Continue)
            }
            _ => Ok(Flow::Done),
        }))?;
    }
    engine.add_thread(thread_body(move |ctx, unit| match unit {
        0 => {
            ctx.barrier_wait(&barrier)?;
            ctx.barrier_wait(&barrier)?;
            Ok(Flow::Continue)
        }
        1 => {
            ctx.barrier_wait(&barrier)?;
            ctx.lock(&m)?;
            ctx.write(load_ptr(ctx, slot)?, b"late")?;
            ctx.unlock(&m)?;
            Ok(Flow::Continue)
        }
        _ => Ok(Flow::Done),
    }))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_and_findable() {
        for s in SCENARIOS {
            assert_eq!(find(s.name).map(|f| f.name), Some(s.name));
            assert_eq!(SCENARIOS.iter().filter(|o| o.name == s.name).count(), 1);
        }
        assert!(find("no-such-scenario").is_none());
    }
}
