// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The four client call façades over a session (§4.4): `Unary`,
//! `BiDirectional`, `SendOnly`, `RecvOnly`. All four share the same open
//! step (`ClientConnection::open_session`) and close with a `Close`
//! message; they differ only in how they drive the session's send/recv
//! halves.

pub mod bidir;
pub mod recv_only;
pub mod send_only;
pub mod unary;

pub use bidir::BiDirectional;
pub use recv_only::RecvOnly;
pub use send_only::SendOnly;
pub use unary::Unary;
