use std::collections::HashSet;

/// Hands out physical tree names. A name is never handed out twice for
/// the lifetime of the generator, so a dropped-and-recreated object does
/// not collide with trees that still await reclamation.
#[derive(Debug, Clone, Default)]
pub struct TreeNameGenerator {
    used: HashSet<String>,
}

impl TreeNameGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_used<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            used: names.into_iter().map(Into::into).collect(),
        }
    }

    /// `<schema>.<object>`, suffixed with `$<n>` when already taken.
    pub fn generate(&mut self, schema: &str, object: &str) -> String {
        let base = format!("{schema}.{object}");
        if self.used.insert(base.clone()) {
            return base;
        }
        let mut n = 1u64;
        loop {
            let candidate = format!("{base}${n}");
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Marks an externally chosen name as used. Returns false when it was
    /// already known.
    pub fn claim(&mut self, name: &str) -> bool {
        self.used.insert(name.to_string())
    }

    pub fn is_used(&self, name: &str) -> bool {
        self.used.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::TreeNameGenerator;

    #[test]
    fn names_are_unique_across_recreation() {
        let mut names = TreeNameGenerator::new();
        assert_eq!(names.generate("s", "t"), "s.t");
        assert_eq!(names.generate("s", "t"), "s.t$1");
        assert_eq!(names.generate("s", "t"), "s.t$2");
        assert_eq!(names.generate("s", "u"), "s.u");
    }

    #[test]
    fn seeded_names_are_skipped() {
        let mut names = TreeNameGenerator::with_used(["s.t", "s.t$1"]);
        assert_eq!(names.generate("s", "t"), "s.t$2");
        assert!(!names.claim("s.t"));
        assert!(names.claim("s.adopted"));
        assert!(names.is_used("s.adopted"));
    }
}
