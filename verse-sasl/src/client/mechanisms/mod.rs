// Copyright (c) 2026 verse contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Provides concrete client mechanism implementations.

mod anonymous;
mod digest_md5;
mod external;
mod oauthbearer;
mod plain;
mod scram;
mod xoauth2;

pub use self::anonymous::Anonymous;
pub use self::digest_md5::DigestMd5;
pub use self::external::External;
pub use self::oauthbearer::OAuthBearer;
pub use self::plain::Plain;
pub use self::scram::ScramSha1;
pub use self::xoauth2::XOAuth2;
