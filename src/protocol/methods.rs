use std::fmt;

const NO_AUTH_REQUIRED: u8 = 0x00;
const GSSAPI: u8 = 0x01;
const USERNAME_PASSWORD: u8 = 0x02;

const IANA_ASSIGNED_LOWER: u8 = 0x03;
const IANA_ASSIGNED_UPPER: u8 = 0x7F;

const PRIVATE_METHOD_LOWER: u8 = 0x80;
const PRIVATE_METHOD_UPPER: u8 = 0xFE;

const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
/// Authentication methods a SOCKS5 server may select during method negotiation.
///
/// Transocks only ever offers [`AuthMethod::NoAuthRequired`]; the other
/// variants exist so a server's answer can be reported precisely.
pub enum AuthMethod {
    /// No authentication is required.
    NoAuthRequired,

    /// GSSAPI authentication.
    Gssapi,

    /// Username and password authentication (RFC 1929).
    UsernamePassword,

    /// IANA assigned methods, `0x03..=0x7F`.
    IanaAssigned(u8),

    /// Methods reserved for private use, `0x80..=0xFE`.
    PrivateMethods(u8),

    /// The server accepts none of the offered methods.
    NoAcceptableMethods,
}

impl AuthMethod {
    pub fn from_u8(value: u8) -> Self {
        match value {
            NO_AUTH_REQUIRED => AuthMethod::NoAuthRequired,
            GSSAPI => AuthMethod::Gssapi,
            USERNAME_PASSWORD => AuthMethod::UsernamePassword,
            IANA_ASSIGNED_LOWER..=IANA_ASSIGNED_UPPER => AuthMethod::IanaAssigned(value),
            PRIVATE_METHOD_LOWER..=PRIVATE_METHOD_UPPER => AuthMethod::PrivateMethods(value),
            NO_ACCEPTABLE_METHODS => AuthMethod::NoAcceptableMethods,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            AuthMethod::NoAuthRequired => NO_AUTH_REQUIRED,
            AuthMethod::Gssapi => GSSAPI,
            AuthMethod::UsernamePassword => USERNAME_PASSWORD,
            AuthMethod::IanaAssigned(value) => value,
            AuthMethod::PrivateMethods(value) => value,
            AuthMethod::NoAcceptableMethods => NO_ACCEPTABLE_METHODS,
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::NoAuthRequired => write!(f, "no authentication"),
            AuthMethod::Gssapi => write!(f, "GSSAPI"),
            AuthMethod::UsernamePassword => write!(f, "username/password"),
            AuthMethod::IanaAssigned(value) => write!(f, "IANA assigned method {:#04x}", value),
            AuthMethod::PrivateMethods(value) => write!(f, "private method {:#04x}", value),
            AuthMethod::NoAcceptableMethods => write!(f, "no acceptable methods"),
        }
    }
}
