use super::ProcMapError;
use itertools::Itertools;
use std::fmt;

/// names travel in the `name=size,...` wire form
fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(&[',', '='][..])
}

/// Ordered list of named process groups and their sizes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupSpec {
    entries: Vec<(String, i32)>,
}

impl GroupSpec {
    pub fn new<S: Into<String>>(entries: impl IntoIterator<Item = (S, i32)>) -> Self {
        Self {
            entries: entries.into_iter().map(|(name, size)| (name.into(), size)).collect(),
        }
    }

    /// Command-line form: `name=size` or a bare `name`. Bare names and names
    /// from `all_groups` that were not mentioned share the processes left
    /// over after the sized ones, the last of them taking the remainder.
    pub fn parse<S: AsRef<str>>(entries: &[S], world_size: i32, all_groups: &[S]) -> Result<Self, ProcMapError> {
        let mut requested: Vec<(String, Option<i32>)> = Vec::new();

        for entry in entries {
            let entry = entry.as_ref().trim();
            let (name, size) = match entry.split_once('=') {
                Some((name, size)) => {
                    let size = size
                        .trim()
                        .parse::<i32>()
                        .ok()
                        .filter(|size| *size > 0)
                        .ok_or_else(|| ProcMapError::InvalidEntry(entry.to_string()))?;
                    (name.trim(), Some(size))
                }
                None => (entry, None),
            };

            if name.is_empty() {
                return Err(ProcMapError::InvalidEntry(entry.to_string()));
            }
            if requested.iter().any(|(known, _)| known == name) {
                return Err(ProcMapError::DuplicateGroup(name.to_string()));
            }
            requested.push((name.to_string(), size));
        }

        for name in all_groups {
            let name = name.as_ref();
            if !requested.iter().any(|(known, _)| known == name) {
                requested.push((name.to_string(), None));
            }
        }

        let requested = requested
            .into_iter()
            .map(|(name, size)| (name, size.unwrap_or(0)))
            .collect_vec();

        Self::resolve(&requested, world_size)
    }

    /// Fill in sizes `<= 0` from what is left of `total` after the sized
    /// groups; the last unsized group takes the remainder.
    pub fn resolve<S: AsRef<str>>(requested: &[(S, i32)], total: i32) -> Result<Self, ProcMapError> {
        if let Some((name, _)) = requested.iter().find(|(name, _)| !is_valid_name(name.as_ref())) {
            return Err(ProcMapError::InvalidEntry(name.as_ref().to_string()));
        }

        let fixed: i32 = requested.iter().map(|(_, size)| *size).filter(|size| *size > 0).sum();
        if fixed > total {
            return Err(ProcMapError::OverSubscribed {
                requested: fixed,
                available: total,
            });
        }

        let unsized_count = requested.iter().filter(|(_, size)| *size <= 0).count() as i32;
        let leftover = total - fixed;
        if unsized_count > 0 && leftover < unsized_count {
            return Err(ProcMapError::OverSubscribed {
                requested: fixed + unsized_count,
                available: total,
            });
        }

        let share = if unsized_count > 0 { leftover / unsized_count } else { 0 };
        let mut seen = 0;
        let entries = requested
            .iter()
            .map(|(name, size)| {
                let size = if *size > 0 {
                    *size
                } else {
                    seen += 1;
                    if seen == unsized_count {
                        leftover - share * (unsized_count - 1)
                    } else {
                        share
                    }
                };
                (name.as_ref().to_string(), size)
            })
            .collect();

        Ok(Self { entries })
    }

    /// `a=2,b=2`
    pub fn to_wire(&self) -> String {
        self.entries
            .iter()
            .map(|(name, size)| format!("{name}={size}"))
            .join(",")
    }

    pub fn from_wire(wire: &str) -> Result<Self, ProcMapError> {
        if wire.is_empty() {
            return Ok(Self::default());
        }

        wire.split(',')
            .map(|entry| {
                let (name, size) = entry
                    .split_once('=')
                    .ok_or_else(|| ProcMapError::InvalidEntry(entry.to_string()))?;
                let size = size
                    .parse::<i32>()
                    .map_err(|_| ProcMapError::InvalidEntry(entry.to_string()))?;
                Ok((name.to_string(), size))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|entries| Self { entries })
    }

    pub fn total(&self) -> i32 {
        self.entries.iter().map(|(_, size)| *size).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i32)> {
        self.entries.iter().map(|(name, size)| (name.as_str(), *size))
    }
}

impl fmt::Display for GroupSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}
