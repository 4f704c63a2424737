// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-call state (§3, §5). A session is a logical RPC invocation
//! multiplexed over a connection. The connection is the sole owner: it holds
//! the sending half of each session's receive queue and is the sole party
//! that ever closes it, which is what lets client/server avoid a
//! connection<->session reference cycle (see DESIGN.md / §9 "Cyclic
//! ownership").

pub mod client_session;
pub mod server_session;

pub use client_session::ClientSession;
pub use server_session::ServerSession;
