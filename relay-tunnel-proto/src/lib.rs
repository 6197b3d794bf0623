//! This crate describes the session protocol spoken by a host and a client over a relay
//! connection, and provides async serialization for all of its messages.
//!
//! The relay pairs a host's connection with a client's connection and then passes bytes between
//! them untouched. It knows nothing about this protocol, so everything here is end-to-end between
//! the two peers.
//!
//! # Handshake
//! As soon as the transport is up, each side sends a [`Hello`](messages::Hello): the magic bytes
//! `TRLY`, the protocol version as an `u16`, and its role as an `u8`. It then reads the other
//! side's hello. If the magic or the version don't match, or both sides claim the same role, the
//! session is not established. Access was already proven when the transport was dialed with the
//! bearer token, so nothing else is negotiated.
//!
//! # Frames
//! After the handshake, both directions carry a sequence of frames (see
//! [`SessionMessage`](messages::SessionMessage)). There are two kinds of traffic:
//!
//! ## Global requests
//! Session-level requests, answered in the same order they were sent. The host uses
//! `tcpip-forward` to advertise each of its tunnel's ports, and `cancel-tcpip-forward` to retract
//! one. Both carry the port as an `u32`, and a success reply echoes it back. Any request a peer
//! doesn't understand must be answered with a failure, never ignored, otherwise the sender would
//! wait on it forever and every reply after it would be mismatched.
//!
//! ## Channels
//! A channel is an independent byte stream within the session. The client opens `direct-tcpip`
//! channels towards an advertised port, picking a channel ID it never used before in this session.
//! The open carries a [`PortForwardChannelOpen`](messages::PortForwardChannelOpen) payload. The
//! host answers with a confirmation or with a failure carrying an
//! [`OpenFailureReason`](messages::OpenFailureReason). Once confirmed, both sides send data
//! frames, an EOF when they're done writing, and a close when they're done with the channel
//! altogether. A channel ID may not be reused within a session.
//!
//! `forwarded-tcpip` (host-initiated channels) is part of the vocabulary but not implemented.
//! Offers of this type are rejected.

pub mod messages;
pub mod serialize;
