/*
 * mechanism.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portcullis, an IMAP/POP3 login front-end.
 *
 * Portcullis is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portcullis is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portcullis.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Authentication mechanism bits and protocol tags as exchanged with auth workers.

use bitflags::bitflags;

bitflags! {
    /// Set of SASL mechanisms. On the wire each mechanism is one bit of a u32;
    /// a worker advertises the union of the mechanisms it implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AuthMech: u32 {
        const PLAIN = 0x01;
        const DIGEST_MD5 = 0x02;
        const ANONYMOUS = 0x04;
        const CRAM_MD5 = 0x08;
        const LOGIN = 0x10;
        const GSSAPI = 0x20;
        const SCRAM_SHA_256 = 0x40;
        const XOAUTH2 = 0x80;
    }
}

const MECH_NAMES: [(AuthMech, &str); 8] = [
    (AuthMech::PLAIN, "PLAIN"),
    (AuthMech::DIGEST_MD5, "DIGEST-MD5"),
    (AuthMech::ANONYMOUS, "ANONYMOUS"),
    (AuthMech::CRAM_MD5, "CRAM-MD5"),
    (AuthMech::LOGIN, "LOGIN"),
    (AuthMech::GSSAPI, "GSSAPI"),
    (AuthMech::SCRAM_SHA_256, "SCRAM-SHA-256"),
    (AuthMech::XOAUTH2, "XOAUTH2"),
];

impl AuthMech {
    /// SASL name of a single mechanism; `None` for empty or combined sets.
    pub fn name(&self) -> Option<&'static str> {
        MECH_NAMES
            .iter()
            .find(|(mech, _)| mech == self)
            .map(|(_, name)| *name)
    }

    /// Look up a SASL name such as `CRAM-MD5`, ignoring case and surrounding space.
    pub fn from_sasl_name(name: &str) -> Option<Self> {
        let name = name.trim();
        MECH_NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(mech, _)| *mech)
    }

    /// True if exactly one mechanism bit is set.
    pub fn is_single(&self) -> bool {
        self.bits().count_ones() == 1
    }

    /// Mechanisms that send the password in the clear and must only be offered over TLS.
    pub fn requires_tls(&self) -> bool {
        self.intersects(AuthMech::PLAIN | AuthMech::LOGIN | AuthMech::XOAUTH2)
    }
}

impl std::fmt::Display for AuthMech {
    /// Space-separated SASL names, as used in a CAPABILITY `AUTH=` list.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for mech in self.iter() {
            if let Some(name) = mech.name() {
                if !first {
                    write!(f, " ")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Client protocol on whose behalf a login is being authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthProtocol {
    Imap,
    Pop3,
}

impl AuthProtocol {
    pub fn code(&self) -> u8 {
        match self {
            AuthProtocol::Imap => 0x01,
            AuthProtocol::Pop3 => 0x02,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(AuthProtocol::Imap),
            0x02 => Some(AuthProtocol::Pop3),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthProtocol::Imap => "IMAP",
            AuthProtocol::Pop3 => "POP3",
        }
    }
}

impl std::fmt::Display for AuthProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
