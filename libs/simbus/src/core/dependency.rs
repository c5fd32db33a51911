//! Input → output-group dependency matrices, as reported by elements.

use crate::core::error::{Result, SimbusError};

/// How one output group of an element depends on one of its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dependency {
    #[default]
    Independent,
    Dependent,
    /// Dependent through a linear relation.
    Linear,
    /// Dependent through a fixed (constant) relation.
    Fixed,
}

impl Dependency {
    pub fn is_dependent(&self) -> bool {
        !matches!(self, Dependency::Independent)
    }
}

/// An `inputs x output-groups` matrix of [`Dependency`] entries.
#[derive(Debug, Clone)]
pub struct DependencyMatrix {
    num_in: usize,
    num_out: usize,
    deps: Vec<Dependency>,
}

impl DependencyMatrix {
    /// All entries independent.
    pub fn independent(num_in: usize, num_out: usize) -> Self {
        Self {
            num_in,
            num_out,
            deps: vec![Dependency::Independent; num_in * num_out],
        }
    }

    /// Every out group depends on every input; the conservative default
    /// for elements that do not override their dependencies.
    pub fn all_dependent(num_in: usize, num_out: usize) -> Self {
        Self {
            num_in,
            num_out,
            deps: vec![Dependency::Dependent; num_in * num_out],
        }
    }

    pub fn num_in(&self) -> usize {
        self.num_in
    }

    pub fn num_out(&self) -> usize {
        self.num_out
    }

    pub fn set(&mut self, in_index: usize, out_index: usize, dep: Dependency) -> Result<()> {
        if in_index >= self.num_in {
            return Err(SimbusError::Scheduling(format!(
                "dependency: in index {in_index} out of bounds [0, {}]",
                self.num_in.saturating_sub(1)
            )));
        }
        if out_index >= self.num_out {
            return Err(SimbusError::Scheduling(format!(
                "dependency: out index {out_index} out of bounds [0, {}]",
                self.num_out.saturating_sub(1)
            )));
        }
        self.deps[out_index * self.num_in + in_index] = dep;
        Ok(())
    }

    pub fn get(&self, in_index: usize, out_index: usize) -> Result<Dependency> {
        if self.num_out == 0 {
            return Ok(Dependency::Independent);
        }
        if in_index >= self.num_in {
            return Err(SimbusError::Scheduling(format!(
                "dependency: in index {in_index} out of bounds [0, {}]",
                self.num_in.saturating_sub(1)
            )));
        }
        if out_index >= self.num_out {
            return Err(SimbusError::Scheduling(format!(
                "dependency: out index {out_index} out of bounds [0, {}]",
                self.num_out.saturating_sub(1)
            )));
        }
        Ok(self.deps[out_index * self.num_in + in_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_independent() {
        let m = DependencyMatrix::independent(2, 3);
        assert_eq!(m.get(1, 2).unwrap(), Dependency::Independent);
    }

    #[test]
    fn test_set_get_roundtrip() {
        let mut m = DependencyMatrix::independent(2, 2);
        m.set(0, 1, Dependency::Dependent).unwrap();
        assert_eq!(m.get(0, 1).unwrap(), Dependency::Dependent);
        assert_eq!(m.get(1, 1).unwrap(), Dependency::Independent);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut m = DependencyMatrix::independent(1, 1);
        assert!(m.set(1, 0, Dependency::Dependent).is_err());
        assert!(m.get(0, 1).is_err());
    }

    #[test]
    fn test_zero_out_groups_reads_independent() {
        let m = DependencyMatrix::independent(3, 0);
        assert_eq!(m.get(1, 0).unwrap(), Dependency::Independent);
    }
}
