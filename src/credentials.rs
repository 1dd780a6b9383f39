use std::fmt;

/// Outcome of [`CredentialStore::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The token was appended at this index and became the current credential.
    Added(usize),
    /// An identical token already exists; the store is unchanged.
    Duplicate,
}

/// Error returned by [`CredentialStore::set_current`] for an out-of-range index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("credential index {index} out of bounds (store holds {len})")]
pub struct IndexOutOfBounds {
    pub index: usize,
    pub len: usize,
}

/// Outcome of [`CredentialStore::rotate_with`].
pub enum Rotation<T> {
    /// Rotation landed on a credential the configure callback accepted.
    Switched { index: usize, configured: T },
    /// Every credential was tried exactly once and none configured successfully.
    Exhausted,
}

impl<T> fmt::Debug for Rotation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rotation::Switched { index, .. } => {
                f.debug_struct("Switched").field("index", index).finish()
            }
            Rotation::Exhausted => write!(f, "Exhausted"),
        }
    }
}

/// An ordered list of API tokens plus a pointer to the one in use.
///
/// Insertion order is rotation priority. The pointer is always either `None`
/// or a valid index into the list; `remove` re-nulls or re-clamps it so the
/// invariant holds across any sequence of operations.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    tokens: Vec<String>,
    current: Option<usize>,
}

impl CredentialStore {
    pub fn new(tokens: Vec<String>, current: Option<usize>) -> Self {
        let current = current.filter(|&i| i < tokens.len());
        Self { tokens, current }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn current_token(&self) -> Option<&str> {
        self.current.map(|i| self.tokens[i].as_str())
    }

    /// Append a token and make it current. Duplicates (string equality) are
    /// rejected without touching the store.
    pub fn add(&mut self, token: impl Into<String>) -> AddOutcome {
        let token = token.into();
        if self.tokens.iter().any(|t| *t == token) {
            return AddOutcome::Duplicate;
        }
        self.tokens.push(token);
        let index = self.tokens.len() - 1;
        self.current = Some(index);
        AddOutcome::Added(index)
    }

    /// Remove the token at `index`, keeping the current pointer aligned:
    /// removing the pointed-to entry nulls the pointer, removing an earlier
    /// entry shifts it down by one.
    pub fn remove(&mut self, index: usize) -> Option<String> {
        if index >= self.tokens.len() {
            return None;
        }
        let removed = self.tokens.remove(index);
        self.current = match self.current {
            Some(cur) if cur == index => None,
            Some(cur) if cur > index => Some(cur - 1),
            other => other,
        };
        Some(removed)
    }

    pub fn set_current(&mut self, index: usize) -> Result<(), IndexOutOfBounds> {
        if index >= self.tokens.len() {
            return Err(IndexOutOfBounds {
                index,
                len: self.tokens.len(),
            });
        }
        self.current = Some(index);
        Ok(())
    }

    /// Advance to the next credential, wrapping, until `configure` accepts one.
    ///
    /// Each candidate is handed to `configure` (which rebuilds the downstream
    /// completion service); a candidate whose configuration fails is skipped.
    /// Every credential is tried exactly once — including wrapping back to the
    /// starting one — before giving up with [`Rotation::Exhausted`].
    pub fn rotate_with<T, F>(&mut self, mut configure: F) -> Rotation<T>
    where
        F: FnMut(&str) -> anyhow::Result<T>,
    {
        let len = self.tokens.len();
        if len == 0 {
            return Rotation::Exhausted;
        }

        let start = self.current.unwrap_or(len - 1);
        for step in 1..=len {
            let index = (start + step) % len;
            self.current = Some(index);
            match configure(&self.tokens[index]) {
                Ok(configured) => {
                    log::info!("switched to credential index {index}");
                    return Rotation::Switched { index, configured };
                }
                Err(e) => {
                    log::warn!("credential at index {index} failed to configure: {e}");
                }
            }
        }

        Rotation::Exhausted
    }
}
