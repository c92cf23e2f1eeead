//! Object attribute model
//!
//! Plain value types carried between the server's generic attribute list
//! and the store's stat-like node attributes.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Seconds and nanoseconds since the epoch.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timespec {
    /// Whole seconds.
    pub secs: i64,
    /// Nanosecond remainder.
    pub nsecs: u32,
}

impl Timespec {
    /// Builds a timestamp from parts.
    pub fn new(secs: i64, nsecs: u32) -> Self {
        Self { secs, nsecs }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: d.as_secs() as i64,
            nsecs: d.subsec_nanos(),
        }
    }
}

/// Filesystem object type, derived from the POSIX mode bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    /// Regular file.
    RegularFile,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Block device.
    BlockDevice,
    /// Character device.
    CharDevice,
    /// Named pipe.
    Fifo,
    /// Unix domain socket.
    Socket,
    /// Mode bits carried no recognizable type.
    Unknown,
}

impl ObjectKind {
    /// Extracts the object type from POSIX mode bits.
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFREG => ObjectKind::RegularFile,
            libc::S_IFDIR => ObjectKind::Directory,
            libc::S_IFLNK => ObjectKind::Symlink,
            libc::S_IFBLK => ObjectKind::BlockDevice,
            libc::S_IFCHR => ObjectKind::CharDevice,
            libc::S_IFIFO => ObjectKind::Fifo,
            libc::S_IFSOCK => ObjectKind::Socket,
            _ => ObjectKind::Unknown,
        }
    }
}

/// POSIX-style attributes of a store node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttr {
    /// Type and permission bits.
    pub mode: u32,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Size in bytes.
    pub size: u64,
    /// Hard link count.
    pub nlink: u32,
    /// Device number for device nodes.
    pub rdev: u64,
    /// Filesystem id the node lives on.
    pub dev: u64,
    /// Node number, unique within the filesystem.
    pub ino: u64,
    /// Space consumed in bytes.
    pub used: u64,
    /// Last access time.
    pub atime: Timespec,
    /// Last data modification time.
    pub mtime: Timespec,
    /// Last status change time.
    pub ctime: Timespec,
}

impl NodeAttr {
    /// The object type encoded in the mode bits.
    pub fn kind(&self) -> ObjectKind {
        ObjectKind::from_mode(self.mode)
    }
}

/// Mask naming which attributes an `AttrList` carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttrMask(u32);

impl AttrMask {
    /// Object type.
    pub const TYPE: AttrMask = AttrMask(0x0001);
    /// Size.
    pub const SIZE: AttrMask = AttrMask(0x0002);
    /// Filesystem id.
    pub const FSID: AttrMask = AttrMask(0x0004);
    /// File id.
    pub const FILEID: AttrMask = AttrMask(0x0008);
    /// Permission bits.
    pub const MODE: AttrMask = AttrMask(0x0010);
    /// Hard link count.
    pub const NUMLINKS: AttrMask = AttrMask(0x0020);
    /// Owner.
    pub const OWNER: AttrMask = AttrMask(0x0040);
    /// Group.
    pub const GROUP: AttrMask = AttrMask(0x0080);
    /// Access time.
    pub const ATIME: AttrMask = AttrMask(0x0100);
    /// Raw device number.
    pub const RAWDEV: AttrMask = AttrMask(0x0200);
    /// Change time.
    pub const CTIME: AttrMask = AttrMask(0x0400);
    /// Modification time.
    pub const MTIME: AttrMask = AttrMask(0x0800);
    /// Space used.
    pub const SPACEUSED: AttrMask = AttrMask(0x1000);
    /// Attribute change time.
    pub const CHGTIME: AttrMask = AttrMask(0x2000);
    /// Access time set to the server's clock.
    pub const ATIME_SERVER: AttrMask = AttrMask(0x4000);
    /// Modification time set to the server's clock.
    pub const MTIME_SERVER: AttrMask = AttrMask(0x8000);

    /// Attributes this FSAL can interpret or supply.
    pub const SUPPORTED: AttrMask = AttrMask(
        Self::TYPE.0
            | Self::SIZE.0
            | Self::FSID.0
            | Self::FILEID.0
            | Self::MODE.0
            | Self::NUMLINKS.0
            | Self::OWNER.0
            | Self::GROUP.0
            | Self::ATIME.0
            | Self::RAWDEV.0
            | Self::CTIME.0
            | Self::MTIME.0
            | Self::SPACEUSED.0
            | Self::CHGTIME.0,
    );

    /// Attributes this FSAL can set.
    pub const SETTABLE: AttrMask = AttrMask(
        Self::MODE.0
            | Self::OWNER.0
            | Self::GROUP.0
            | Self::ATIME.0
            | Self::CTIME.0
            | Self::MTIME.0
            | Self::SIZE.0
            | Self::MTIME_SERVER.0
            | Self::ATIME_SERVER.0,
    );

    /// Empty mask.
    pub fn empty() -> Self {
        AttrMask(0)
    }

    /// True when no bit is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when any bit of `other` is set here.
    pub fn contains(self, other: AttrMask) -> bool {
        (self.0 & other.0) != 0
    }

    /// The bits set here but not in `other`.
    pub fn without(self, other: AttrMask) -> AttrMask {
        AttrMask(self.0 & !other.0)
    }
}

impl std::ops::BitOr for AttrMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        AttrMask(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for AttrMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// The server's generic attribute list: a mask naming which attributes
/// are present plus their values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttrList {
    /// Attributes present in `attrs`.
    pub mask: AttrMask,
    /// Attribute values; fields outside `mask` are meaningless.
    pub attrs: NodeAttr,
}

impl AttrList {
    /// A list carrying nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A list carrying only a mode.
    pub fn with_mode(mode: u32) -> Self {
        Self {
            mask: AttrMask::MODE,
            attrs: NodeAttr {
                mode,
                ..NodeAttr::default()
            },
        }
    }
}

/// Clears the umask bits from a requested mode.
pub fn apply_umask(mode: u32, umask: u32) -> u32 {
    mode & !umask
}

/// Exclusive-create verifier. Embedded into the created object's
/// timestamps so a retried create request can be recognized.
pub type Verifier = [u8; 8];

/// Embeds `verifier` into the access and modification times of `attrs`.
pub fn set_verifier(attrs: &mut AttrList, verifier: Verifier) {
    let atime = u32::from_le_bytes([verifier[0], verifier[1], verifier[2], verifier[3]]);
    let mtime = u32::from_le_bytes([verifier[4], verifier[5], verifier[6], verifier[7]]);
    attrs.attrs.atime = Timespec::new(i64::from(atime), 0);
    attrs.attrs.mtime = Timespec::new(i64::from(mtime), 0);
    attrs.mask |= AttrMask::ATIME | AttrMask::MTIME;
}

/// True when `attr` carries the timestamps a previous exclusive create
/// embedded for `verifier`.
pub fn check_verifier(attr: &NodeAttr, verifier: Verifier) -> bool {
    let atime = u32::from_le_bytes([verifier[0], verifier[1], verifier[2], verifier[3]]);
    let mtime = u32::from_le_bytes([verifier[4], verifier[5], verifier[6], verifier[7]]);
    attr.atime.secs == i64::from(atime) && attr.mtime.secs == i64::from(mtime)
}
