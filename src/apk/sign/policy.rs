use std::fmt;

/// Android 7.0.
pub const V2_MIN_API: u32 = 24;
/// Android 9.
pub const V3_MIN_API: u32 = 28;
/// Android 11.
pub const V4_MIN_API: u32 = 30;
/// Android 4.3, the first release verifying SHA-256 JAR digests.
pub const SHA256_V1_MIN_API: u32 = 18;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SigningScheme {
    /// JAR signing.
    V1,
    /// APK Signature Scheme v2.
    V2,
    /// APK Signature Scheme v3.
    V3,
    /// APK Signature Scheme v4, a detached `.idsig` file.
    V4,
}

impl fmt::Display for SigningScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
            Self::V3 => "v3",
            Self::V4 => "v4",
        };
        f.write_str(name)
    }
}

/// The schemes applied by one signing call.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SchemeSet {
    pub v1: bool,
    pub v2: bool,
    pub v3: bool,
    pub v4: bool,
}

impl SchemeSet {
    pub fn contains(&self, scheme: SigningScheme) -> bool {
        match scheme {
            SigningScheme::V1 => self.v1,
            SigningScheme::V2 => self.v2,
            SigningScheme::V3 => self.v3,
            SigningScheme::V4 => self.v4,
        }
    }

    /// Enabled schemes in ascending order.
    pub fn schemes(&self) -> Vec<SigningScheme> {
        [
            SigningScheme::V1,
            SigningScheme::V2,
            SigningScheme::V3,
            SigningScheme::V4,
        ]
        .into_iter()
        .filter(|scheme| self.contains(*scheme))
        .collect()
    }
}

impl fmt::Display for SchemeSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names: Vec<_> = self.schemes().iter().map(ToString::to_string).collect();
        f.write_str(&names.join("+"))
    }
}

/// Maps the minimum platform API level a package targets to the schemes it
/// is signed with.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SchemePolicy {
    /// Emit a v4 signature on API 30 and above. Off unless asked for.
    pub v4_enabled: bool,
}

impl SchemePolicy {
    pub fn new(v4_enabled: bool) -> Self {
        Self { v4_enabled }
    }

    pub fn select(&self, api_level: u32) -> SchemeSet {
        SchemeSet {
            v1: true,
            v2: api_level >= V2_MIN_API,
            v3: api_level >= V3_MIN_API,
            v4: self.v4_enabled && api_level >= V4_MIN_API,
        }
    }
}

/// [`SchemePolicy::select`] with v4 disabled.
pub fn select_schemes(api_level: u32) -> SchemeSet {
    SchemePolicy::default().select(api_level)
}
