//! Share reservation bookkeeping
//!
//! CoralFS has no file-descriptor abstraction and forbids concurrent opens
//! of a node, so every logical open of an object is arbitrated here: a
//! per-object set of counters tracks who holds the object open for read,
//! write, or read-write and which deny bits they assert. The counters are
//! mutated only under the owning handle's object lock, held across the
//! whole check-then-update sequence.

use crate::error::{FsalError, Result};

/// Access and deny bits for one open of an object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct ShareMode(u32);

impl ShareMode {
    /// No access, no deny: the closed mode.
    pub const CLOSED: ShareMode = ShareMode(0);
    /// Read access.
    pub const READ: ShareMode = ShareMode(0x01);
    /// Write access.
    pub const WRITE: ShareMode = ShareMode(0x02);
    /// Read and write access.
    pub const RDWR: ShareMode = ShareMode(0x03);
    /// Deny other openers read access.
    pub const DENY_READ: ShareMode = ShareMode(0x04);
    /// Deny other openers write access.
    pub const DENY_WRITE: ShareMode = ShareMode(0x08);
    /// Truncate on open. An open flag, not a reservation bit.
    pub const TRUNC: ShareMode = ShareMode(0x10);

    /// True when any bit of `other` is set in this mode.
    pub fn contains(self, other: ShareMode) -> bool {
        (self.0 & other.0) != 0
    }

    /// True when the mode carries read or write access.
    pub fn has_access(self) -> bool {
        self.contains(Self::RDWR)
    }
}

impl std::ops::BitOr for ShareMode {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        ShareMode(self.0 | rhs.0)
    }
}

/// Per-object share reservation counters.
///
/// One count per access and deny bit across every upper-layer state
/// currently holding the object open. All counters at zero means the
/// object is closed and releasing the underlying store node is safe.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShareState {
    access_read: u32,
    access_write: u32,
    deny_read: u32,
    deny_write: u32,
}

impl ShareState {
    /// A zeroed share state.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no state holds the object open.
    pub fn is_closed(&self) -> bool {
        self.access_read == 0
            && self.access_write == 0
            && self.deny_read == 0
            && self.deny_write == 0
    }

    /// Checks a requested mode against the reservations currently held.
    ///
    /// A request conflicts when its access intersects an existing deny or
    /// its deny intersects an existing access. `bypass` skips the deny
    /// checks against the requested access (special stateids, share-check
    /// bypass on setattr); a requested deny against an existing access is
    /// never bypassed. No state change on either outcome.
    pub fn check_conflict(&self, req: ShareMode, bypass: bool) -> Result<()> {
        let conflict = (!bypass && req.contains(ShareMode::READ) && self.deny_read > 0)
            || (!bypass && req.contains(ShareMode::WRITE) && self.deny_write > 0)
            || (req.contains(ShareMode::DENY_READ) && self.access_read > 0)
            || (req.contains(ShareMode::DENY_WRITE) && self.access_write > 0);
        if conflict {
            Err(FsalError::share_denied())
        } else {
            Ok(())
        }
    }

    /// Moves the counters from `old` to `new`.
    ///
    /// The caller holds the object lock exclusively and has already run
    /// `check_conflict` for `new`; acquire is `(CLOSED, mode)`, release is
    /// `(mode, CLOSED)`, and an upgrade passes both.
    pub fn update_counters(&mut self, old: ShareMode, new: ShareMode) {
        if old.contains(ShareMode::READ) {
            self.access_read -= 1;
        }
        if old.contains(ShareMode::WRITE) {
            self.access_write -= 1;
        }
        if old.contains(ShareMode::DENY_READ) {
            self.deny_read -= 1;
        }
        if old.contains(ShareMode::DENY_WRITE) {
            self.deny_write -= 1;
        }
        if new.contains(ShareMode::READ) {
            self.access_read += 1;
        }
        if new.contains(ShareMode::WRITE) {
            self.access_write += 1;
        }
        if new.contains(ShareMode::DENY_READ) {
            self.deny_read += 1;
        }
        if new.contains(ShareMode::DENY_WRITE) {
            self.deny_write += 1;
        }
    }

    /// Replaces one holder's `prior` mode with `req`, validating `req`
    /// against the other holders only.
    ///
    /// The prior contribution is removed before the conflict check so a
    /// holder never conflicts with its own reservation, and is restored
    /// untouched when the check fails.
    pub fn try_transition(&mut self, prior: ShareMode, req: ShareMode, bypass: bool) -> Result<()> {
        self.update_counters(prior, ShareMode::CLOSED);
        if let Err(denied) = self.check_conflict(req, bypass) {
            self.update_counters(ShareMode::CLOSED, prior);
            return Err(denied);
        }
        self.update_counters(ShareMode::CLOSED, req);
        Ok(())
    }

    /// Folds a duplicate handle's reservations into this one.
    ///
    /// A second handle that resolved to the same underlying node carries
    /// its intended share here; incompatible reservations are denied and
    /// nothing changes.
    pub fn merge(&mut self, dupe: &ShareState) -> Result<()> {
        let conflict = (dupe.access_read > 0 && self.deny_read > 0)
            || (dupe.access_write > 0 && self.deny_write > 0)
            || (dupe.deny_read > 0 && self.access_read > 0)
            || (dupe.deny_write > 0 && self.access_write > 0);
        if conflict {
            return Err(FsalError::share_denied());
        }
        self.access_read += dupe.access_read;
        self.access_write += dupe.access_write;
        self.deny_read += dupe.deny_read;
        self.deny_write += dupe.deny_write;
        Ok(())
    }
}
