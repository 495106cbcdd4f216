//! Lazy iteration over the directories of an open file.

use std::iter::FusedIterator;

use crate::error::Result;
use crate::file::TiffFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Start,
    Advance,
    Done,
}

/// Forward-only sequence of directory indices.
///
/// The first item is the directory the file is positioned on when the
/// iterator is created. Each later item advances the file's cursor. A failed
/// advance is yielded once and ends the sequence; items already yielded stay
/// valid.
///
/// Iterating moves the file's current directory. To start again, reposition
/// with [`TiffFile::set_directory`] and call [`TiffFile::directories`].
#[derive(Debug)]
pub struct Directories<'f> {
    file: &'f TiffFile,
    step: Step,
}

impl<'f> Directories<'f> {
    pub(crate) fn new(file: &'f TiffFile) -> Self {
        Self {
            file,
            step: Step::Start,
        }
    }
}

impl Iterator for Directories<'_> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step {
            Step::Start => {
                let current = self.file.query_current_directory();
                self.step = if current.is_ok() { Step::Advance } else { Step::Done };
                Some(current)
            }
            Step::Advance => match self.file.read_directory() {
                Ok(true) => Some(Ok(self.file.current_directory())),
                Ok(false) => {
                    self.step = Step::Done;
                    None
                }
                Err(e) => {
                    self.step = Step::Done;
                    Some(Err(e))
                }
            },
            Step::Done => None,
        }
    }
}

impl FusedIterator for Directories<'_> {}
