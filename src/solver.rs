use anyhow::Result;
use minilp::{ComparisonOp, OptimizationDirection, Problem};

use crate::error::RunError;

/// Handle for a variable registered with the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sense {
    Eq,
    Ge,
    Le,
}

#[derive(Debug, Clone, Copy)]
struct VarSpec {
    objective: f64,
    lower: f64,
    upper: f64,
}

#[derive(Debug, Clone)]
struct Constraint {
    terms: Vec<(usize, f64)>,
    sense: Sense,
    rhs: f64,
}

/// Declarative front for the external LP solver: variables and constraints
/// are collected here and handed to the backend on every `minimize` call,
/// so re-solving with adjusted bounds (the confidence probe) never mutates
/// solver state.
#[derive(Debug, Clone, Default)]
pub struct LinearProgram {
    vars: Vec<VarSpec>,
    constraints: Vec<Constraint>,
}

impl LinearProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_variable(&mut self, objective: f64, lower: f64, upper: f64) -> VarId {
        debug_assert!(lower <= upper, "invalid bounds [{lower}, {upper}]");
        self.vars.push(VarSpec {
            objective,
            lower,
            upper,
        });
        VarId(self.vars.len() - 1)
    }

    pub fn set_bounds(&mut self, var: VarId, lower: f64, upper: f64) {
        let spec = &mut self.vars[var.0];
        spec.lower = lower;
        spec.upper = upper;
    }

    pub fn add_constraint(&mut self, terms: &[(VarId, f64)], sense: Sense, rhs: f64) {
        self.constraints.push(Constraint {
            terms: terms.iter().map(|&(var, coef)| (var.0, coef)).collect(),
            sense,
            rhs,
        });
    }

    pub fn num_variables(&self) -> usize {
        self.vars.len()
    }

    pub fn minimize(&self) -> Result<LpSolution> {
        let mut problem = Problem::new(OptimizationDirection::Minimize);
        let handles: Vec<minilp::Variable> = self
            .vars
            .iter()
            .map(|spec| problem.add_var(spec.objective, (spec.lower, spec.upper)))
            .collect();
        for constraint in &self.constraints {
            let terms: Vec<(minilp::Variable, f64)> = constraint
                .terms
                .iter()
                .map(|&(idx, coef)| (handles[idx], coef))
                .collect();
            let op = match constraint.sense {
                Sense::Eq => ComparisonOp::Eq,
                Sense::Ge => ComparisonOp::Ge,
                Sense::Le => ComparisonOp::Le,
            };
            problem.add_constraint(terms.as_slice(), op, constraint.rhs);
        }
        let solution = problem
            .solve()
            .map_err(|e| RunError::Solver(e.to_string()))?;
        let values = handles.iter().map(|&handle| solution[handle]).collect();
        Ok(LpSolution {
            values,
            objective: solution.objective(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct LpSolution {
    values: Vec<f64>,
    objective: f64,
}

impl LpSolution {
    pub fn value(&self, var: VarId) -> f64 {
        self.values[var.0]
    }

    pub fn objective(&self) -> f64 {
        self.objective
    }
}
