/*
 * lib.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Traghetto, a cross-platform file transfer client.
 *
 * Traghetto is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Traghetto is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Traghetto.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Traghetto core: protocol engines and the caches, options, and
//! notification plumbing around them. The UI layers sit on top of
//! [`protocol::ftp::session::FtpSession`] and the notification queue.

pub mod cache;
pub mod extip;
pub mod net;
pub mod notify;
pub mod options;
pub mod path;
pub mod protocol;
