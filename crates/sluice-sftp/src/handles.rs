//! Session-owned table of open file and directory handles
//!
//! NIST 800-53: AC-12 (Session Termination)
//! Implementation: Handles live only as long as the session that issued them;
//! dropping the table releases every open file.

use crate::attrs::NameEntry;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Opaque handle string handed to the client
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle(String);

impl Handle {
    fn generate() -> Self {
        Handle(Uuid::new_v4().simple().to_string())
    }

    /// Handle string as sent on the wire
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Handle {
    fn from(value: String) -> Self {
        Handle(value)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

enum Listing {
    NotStarted,
    Paging(std::vec::IntoIter<NameEntry>),
    Exhausted,
}

enum Entry<F> {
    File { path: String, file: F },
    Directory { path: String, listing: Listing },
}

impl<F> Entry<F> {
    fn path(&self) -> &str {
        match self {
            Entry::File { path, .. } | Entry::Directory { path, .. } => path,
        }
    }
}

/// Resolved view of a handle for operations that accept either kind
pub enum Target<'a, F> {
    /// Open file and the path it was opened with
    File {
        /// Path given at OPEN
        path: &'a str,
        /// Handler's open file
        file: &'a mut F,
    },
    /// Open directory
    Directory {
        /// Path given at OPENDIR
        path: &'a str,
    },
}

/// Open handles for one session
pub struct HandleTable<F> {
    entries: HashMap<Handle, Entry<F>>,
    page_size: usize,
}

impl<F> HandleTable<F> {
    /// Empty table paging directory listings `page_size` entries at a time
    pub fn new(page_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            page_size: page_size.max(1),
        }
    }

    /// Number of open handles
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handles are open
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register an open file
    pub fn create_file_handle(&mut self, path: impl Into<String>, file: F) -> Handle {
        let entry = Entry::File {
            path: path.into(),
            file,
        };
        self.insert(entry)
    }

    /// Register an open directory
    pub fn create_dir_handle(&mut self, path: impl Into<String>) -> Handle {
        let entry = Entry::Directory {
            path: path.into(),
            listing: Listing::NotStarted,
        };
        self.insert(entry)
    }

    fn insert(&mut self, entry: Entry<F>) -> Handle {
        let mut handle = Handle::generate();
        while self.entries.contains_key(&handle) {
            handle = Handle::generate();
        }
        self.entries.insert(handle.clone(), entry);
        handle
    }

    /// Path the handle was opened with
    pub fn resolve(&self, handle: &Handle) -> Result<&str> {
        self.entries
            .get(handle)
            .map(Entry::path)
            .ok_or_else(|| Error::handle_not_found(handle.as_str()))
    }

    /// File handle only; directory handles are rejected
    pub fn resolve_stream(&mut self, handle: &Handle) -> Result<(&str, &mut F)> {
        match self.entries.get_mut(handle) {
            Some(Entry::File { path, file }) => Ok((path.as_str(), file)),
            Some(Entry::Directory { .. }) => Err(Error::invalid_handle(format!(
                "{} is a directory handle",
                handle
            ))),
            None => Err(Error::handle_not_found(handle.as_str())),
        }
    }

    /// Either kind of handle
    pub fn resolve_target(&mut self, handle: &Handle) -> Result<Target<'_, F>> {
        match self.entries.get_mut(handle) {
            Some(Entry::File { path, file }) => Ok(Target::File {
                path: path.as_str(),
                file,
            }),
            Some(Entry::Directory { path, .. }) => Ok(Target::Directory {
                path: path.as_str(),
            }),
            None => Err(Error::handle_not_found(handle.as_str())),
        }
    }

    /// Path of a directory handle; file handles are rejected
    pub fn resolve_dir(&self, handle: &Handle) -> Result<&str> {
        match self.entries.get(handle) {
            Some(Entry::Directory { path, .. }) => Ok(path.as_str()),
            Some(Entry::File { .. }) => Err(Error::invalid_handle(format!(
                "{} is a file handle",
                handle
            ))),
            None => Err(Error::handle_not_found(handle.as_str())),
        }
    }

    /// Remove a handle, returning the file it owned (if any)
    ///
    /// Any directory paging state goes with it.
    pub fn close(&mut self, handle: &Handle) -> Result<Option<F>> {
        match self.entries.remove(handle) {
            Some(Entry::File { file, .. }) => Ok(Some(file)),
            Some(Entry::Directory { .. }) => Ok(None),
            None => Err(Error::handle_not_found(handle.as_str())),
        }
    }

    /// Remove every handle, returning the open files for release
    pub fn drain_files(&mut self) -> Vec<(String, F)> {
        self.entries
            .drain()
            .filter_map(|(_, entry)| match entry {
                Entry::File { path, file } => Some((path, file)),
                Entry::Directory { .. } => None,
            })
            .collect()
    }

    /// Whether the directory listing still has to be materialized
    pub fn needs_listing(&self, handle: &Handle) -> Result<bool> {
        match self.entries.get(handle) {
            Some(Entry::Directory { listing, .. }) => Ok(matches!(listing, Listing::NotStarted)),
            Some(Entry::File { .. }) => Err(Error::invalid_handle(format!(
                "{} is a file handle",
                handle
            ))),
            None => Err(Error::handle_not_found(handle.as_str())),
        }
    }

    /// Store the full listing for a directory handle
    pub fn begin_listing(&mut self, handle: &Handle, entries: Vec<NameEntry>) -> Result<()> {
        match self.entries.get_mut(handle) {
            Some(Entry::Directory { listing, .. }) => {
                *listing = Listing::Paging(entries.into_iter());
                Ok(())
            }
            Some(Entry::File { .. }) => Err(Error::invalid_handle(format!(
                "{} is a file handle",
                handle
            ))),
            None => Err(Error::handle_not_found(handle.as_str())),
        }
    }

    /// Next page of the listing, or `None` once it is exhausted
    ///
    /// The cursor is dropped as soon as it runs dry; later calls keep
    /// returning `None`.
    pub fn next_page(&mut self, handle: &Handle) -> Result<Option<Vec<NameEntry>>> {
        let page_size = self.page_size;
        let listing = match self.entries.get_mut(handle) {
            Some(Entry::Directory { listing, .. }) => listing,
            Some(Entry::File { .. }) => {
                return Err(Error::invalid_handle(format!("{} is a file handle", handle)));
            }
            None => return Err(Error::handle_not_found(handle.as_str())),
        };

        let page: Vec<NameEntry> = match listing {
            Listing::Paging(cursor) => cursor.by_ref().take(page_size).collect(),
            Listing::NotStarted | Listing::Exhausted => Vec::new(),
        };

        if page.is_empty() {
            *listing = Listing::Exhausted;
            Ok(None)
        } else {
            Ok(Some(page))
        }
    }
}
