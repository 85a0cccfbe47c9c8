// SPDX-FileCopyrightText: 2026 silo contributors
// SPDX-License-Identifier: MIT

mod add_to_store;
mod substitute;
mod test_store;
