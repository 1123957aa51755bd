// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::str::FromStr;

use kwin_spin::LockKind;

/// Kernel command line options, `;` separated `key=value` pairs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Bootargs {
    /// Implementation of the big kernel lock, `bkl=clh` or `bkl=spinlock`.
    pub bkl: LockKind,
}

impl FromStr for Bootargs {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bkl = None;

        let parts = s.trim().split(';');
        for part in parts {
            if let Some(current) = part.strip_prefix("bkl=") {
                bkl = Some(LockKind::from_str(current)?);
            }
        }

        Ok(Self {
            bkl: bkl.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_clh() {
        assert_eq!(Bootargs::from_str("").unwrap().bkl, LockKind::Clh);
        assert_eq!(Bootargs::from_str("log=trace").unwrap().bkl, LockKind::Clh);
    }

    #[test]
    fn selects_lock() {
        let args: Bootargs = "log=info;bkl=spinlock".parse().unwrap();
        assert_eq!(args.bkl, LockKind::Spinlock);
        let args: Bootargs = " bkl=clh ".parse().unwrap();
        assert_eq!(args.bkl, LockKind::Clh);
    }

    #[test]
    fn rejects_unknown_lock() {
        let err = Bootargs::from_str("bkl=mcs").unwrap_err();
        assert!(err.to_string().contains("mcs"));
    }
}
