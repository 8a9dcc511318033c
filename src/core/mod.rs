// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

pub mod alerts;
pub mod geocode;
pub mod incident;
