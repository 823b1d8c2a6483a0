// Copyright (c) The partest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Catching panics from test code.
//!
//! A process-wide panic hook records where a panic happened and a backtrace, but only on threads
//! that are currently inside [`catch`]. Everywhere else the previously installed hook runs.

use crate::codec::TestError;
use std::{
    backtrace::Backtrace,
    cell::{Cell, RefCell},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Once,
};

thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
    static LAST_PANIC: RefCell<Option<CapturedPanic>> = const { RefCell::new(None) };
}

struct CapturedPanic {
    location: Option<String>,
    backtrace: Backtrace,
}

pub(super) fn install_hook() {
    static INSTALL: Once = Once::new();

    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if CAPTURING.with(Cell::get) {
                let captured = CapturedPanic {
                    location: info.location().map(|location| location.to_string()),
                    backtrace: Backtrace::capture(),
                };
                LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(captured));
            } else {
                previous(info);
            }
        }));
    });
}

/// Runs `f`, turning a panic into a [`TestError`].
pub(super) fn catch<R>(f: impl FnOnce() -> R) -> Result<R, TestError> {
    let was_capturing = CAPTURING.with(|capturing| capturing.replace(true));
    let res = catch_unwind(AssertUnwindSafe(f));
    CAPTURING.with(|capturing| capturing.set(was_capturing));

    res.map_err(|payload| {
        let captured = LAST_PANIC.with(|slot| slot.borrow_mut().take());
        match captured {
            Some(CapturedPanic {
                location,
                backtrace,
            }) => TestError::from_panic(payload, location, Some(&backtrace)),
            None => TestError::from_panic(payload, None, None),
        }
    })
}
