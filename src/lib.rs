//! psync - incremental directory synchronization over a single stream.
//!
//! A client (sender) holds the authoritative tree and drives the sync;
//! a daemon (receiver) holds the replica. Changed files travel as
//! block-level deltas in the style of rsync: the receiver signs its
//! existing copy with per-block weak and strong hashes, the sender
//! rolls a weak hash over the source and ships only the byte regions
//! the receiver cannot reconstruct locally.
//!
//! ```text
//! sender                               receiver
//!   -- handshake ---------------------->
//!   -- file list ---------------------->
//!                                       [delete extraneous, mkdirs]
//!   <- per-file verdicts + signatures --
//!   -- per-changed-file delta streams ->
//!                                       [rebuild + verify]
//!   <- ack -----------------------------
//! ```
//!
//! The wire protocol lives in [`proto`], the matching machinery in
//! [`delta`], and the two peers in [`sender`]/[`client`] and
//! [`receiver`]/[`server`].

pub mod client;
pub mod delta;
pub mod proto;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod temp;
pub mod walk;
pub mod watch;

pub use client::SyncSession;
pub use receiver::{Receiver, ReceiverSrcFile};
pub use sender::{Sender, SenderSrcFile};
pub use server::Server;
pub use walk::SrcFileLister;
