// Copyright (C) 2026 The spscmq Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue geometry is unusable: {record_count} records of {quantum} bytes")]
    BadGeometry { record_count: usize, quantum: usize },

    #[error("grantor references file descriptor index {0} outside the native handle")]
    BadFdIndex(u32),

    #[error("grantor describes an empty region")]
    EmptyRegion,

    #[error("memfd creation failed: {0}")]
    MemfdFailed(nix::errno::Errno),

    #[error("memory mapping failed: {0}")]
    MmapFailed(#[from] nix::errno::Errno),
}
