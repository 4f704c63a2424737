// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

mod integration_tests {
    pub mod common;

    pub mod bidir_ping_pong;
    pub mod graceful_drain;
    pub mod pool_round_robin;
    pub mod retry_through_chain;
    pub mod send_recv_streams;
    pub mod service_config_timeout;
    pub mod unary_echo;
    pub mod weighted_balancer;
}
