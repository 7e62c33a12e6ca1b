// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The H5DB Authors

pub mod env;
