//! Compile-time configuration.
//!
//! The sizing constants below are deliberately conservative defaults for
//! sub-GHz class links; adjust them to the deployment and rebuild. The
//! behavioral switches are cargo features so that a host application can
//! flip them without editing this file.

/// Maximum size of a whole frame in bytes, header and CRC included.
pub const MAX_PACKET_SIZE: usize = 128;

/// Maximum payload size carried by one frame (7-byte header + 2-byte CRC).
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - 9;

/// Maximum number of variables one context can hold.
pub const REGMAP_SIZE: usize = 20;

/// Number of levels in a variable path.
pub const REGMAP_DEPTH: usize = 3;

/// How many levels below a base path a GET request may descend.
/// Zero refuses recursive requests altogether.
pub const REGMAP_RECURSION: usize = 2;

/// Address that every node listens to.
pub const BROADCAST_ADDRESS: u16 = 0xFFFF;

/// Type of the per-variable auxiliary tag.
pub type VarTag = i32;

/// Wrap single-value GET replies in the verbose `{0: 200, ...}` form even
/// when the request named an exact path.
pub const FORCE_GET_VERBOSE_REPLY: bool = cfg!(feature = "force-get-verbose-reply");

/// Never emit the legacy base-path INFORM layout.
pub const FORCE_NEW_STYLE_INFORM: bool = cfg!(feature = "force-new-style-inform");

/// Collapse a SET reply to the single `{0: code}` entry when every update
/// succeeded.
pub const SET_SHORT_REPLY_IF_OK: bool = cfg!(feature = "set-short-reply-if-ok");

/// Copy the routing-requested bit from a GET/SET request onto its reply.
pub const COPY_ROUTINGREQUEST_ON_ACK: bool = cfg!(feature = "copy-routing-request-on-ack");
