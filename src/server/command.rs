//! Command vocabulary

use std::fmt;

/// Request verbs. Matched case-sensitively against the request header's
/// trailing command name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    // Session
    Login,

    // Statements
    Add,
    Remove,
    Triples,
    Commit,
    Rollback,
    Run,

    // Files
    FilesDelete,
    FilesRename,
    FilesHash,
    FilesUpdate,
    FilesFetch,
}

impl Command {
    pub const ALL: [Command; 12] = [
        Command::Login,
        Command::Add,
        Command::Remove,
        Command::Triples,
        Command::Commit,
        Command::Rollback,
        Command::Run,
        Command::FilesDelete,
        Command::FilesRename,
        Command::FilesHash,
        Command::FilesUpdate,
        Command::FilesFetch,
    ];

    /// None for anything outside the vocabulary.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Login => "LOGIN",
            Command::Add => "ADD",
            Command::Remove => "REMOVE",
            Command::Triples => "TRIPLES",
            Command::Commit => "COMMIT",
            Command::Rollback => "ROLLBACK",
            Command::Run => "RUN",
            Command::FilesDelete => "FILES_DELETE",
            Command::FilesRename => "FILES_RENAME",
            Command::FilesHash => "FILES_HASH",
            Command::FilesUpdate => "FILES_UPDATE",
            Command::FilesFetch => "FILES_FETCH",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
