use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const PYTHON3: &str = "/usr/bin/python3";

/// How a submission is turned into a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Language {
    /// Built ahead of time; the artifact is executed directly.
    Native(Toolchain),
    /// Run through `interpreter` with the script as its first argument.
    Interpreted { interpreter: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toolchain {
    C,
    Cpp,
}

impl Toolchain {
    /// Compiler binary and arguments building `source` into `output`.
    pub fn command<'a>(self, source: &'a Path, output: &'a Path) -> (&'static str, Vec<&'a Path>) {
        let (bin, flags): (_, &[&'static str]) = match self {
            Toolchain::C => ("gcc", &["-O2", "-std=c11", "-o"]),
            Toolchain::Cpp => ("g++", &["-O2", "-std=c++17", "-o"]),
        };
        let mut args: Vec<&Path> = flags.iter().map(|flag| Path::new(*flag)).collect();
        args.push(output);
        args.push(source);
        (bin, args)
    }
}

impl Language {
    pub fn python3() -> Self {
        Language::Interpreted {
            interpreter: PYTHON3.into(),
        }
    }

    pub fn needs_compile(&self) -> bool {
        matches!(self, Language::Native(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLanguage(String);

impl fmt::Display for UnknownLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unsupported language: {:?} (expected one of c, cpp, c++, cxx, python, python3, py)",
            self.0
        )
    }
}

impl std::error::Error for UnknownLanguage {}

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag.to_ascii_lowercase().as_str() {
            "c" => Ok(Language::Native(Toolchain::C)),
            "cpp" | "c++" | "cxx" => Ok(Language::Native(Toolchain::Cpp)),
            "python" | "python3" | "py" => Ok(Language::python3()),
            _ => Err(UnknownLanguage(tag.to_owned())),
        }
    }
}
