use std::fmt;

/// The controller's fixed command vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mnemonic {
    // ---- Measurement ----
    Pr1,
    Pr2,
    Tid,

    // ---- Settings ----
    Cal,
    Uni,
    Fil,
    Dcd,
}

impl Mnemonic {
    pub fn as_str(self) -> &'static str {
        match self {
            Mnemonic::Pr1 => "PR1",
            Mnemonic::Pr2 => "PR2",
            Mnemonic::Tid => "TID",
            Mnemonic::Cal => "CAL",
            Mnemonic::Uni => "UNI",
            Mnemonic::Fil => "FIL",
            Mnemonic::Dcd => "DCD",
        }
    }
}

impl fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single request. Without arguments it reads a value; with arguments it
/// writes one and the device echoes the new setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    mnemonic: Mnemonic,
    args: Vec<String>,
}

impl Command {
    pub fn query(mnemonic: Mnemonic) -> Self {
        Self {
            mnemonic,
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mnemonic: Mnemonic, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mnemonic,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn mnemonic(&self) -> Mnemonic {
        self.mnemonic
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Wire text without the terminator, e.g. `FIL,1,1`.
    pub fn encode(&self) -> String {
        let mut out = String::from(self.mnemonic.as_str());
        for arg in &self.args {
            out.push(',');
            out.push_str(arg);
        }
        out
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
