//! Reaction networks with mass-action and Butler-Volmer kinetics.
//!
//! Reactions are written one per line:
//!
//! ```text
//! A + 2 B <=>[kf][kb] C    # reversible, rate constants kf and kb
//! C ->[k2] D               # irreversible
//! Ox + e- <=>[e0][k0] Red  # electrochemical: standard potential, rate constant
//! ```
//!
//! Rate constants are [`Expression`]s of named parameters. Every species
//! `X` also gets an initial concentration parameter `c0_X`; electrochemical
//! systems get the potential `e` and the `temperature`.

use log::debug;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_until},
    character::complete::{char, digit1, multispace0},
    combinator::{map_res, opt},
    multi::separated_list1,
    sequence::{delimited, terminated},
    IResult, Parser,
};
use ndarray::{ArrayView1, ArrayViewMut1};
use std::collections::HashMap;
use std::fmt;

use crate::error::{FitError, Result};
use crate::parameters::expression::{identifier, spaced};
use crate::parameters::{Expression, SlotValues};

/// Faraday constant, C/mol.
pub const FARADAY: f64 = 96485.33212;

/// Gas constant, J/(mol K).
pub const GAS_CONSTANT: f64 = 8.314462618;

/// Transfer coefficient of electrochemical steps.
pub const ALPHA: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct Species {
    pub name: String,

    /// Indices of the reactions the species takes part in
    pub reactions: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reaction {
    /// Species indices, matching `stoichiometry`
    pub species: Vec<usize>,

    /// Negative for reactants, positive for products
    pub stoichiometry: Vec<i32>,

    /// Electrons consumed by the reaction as written
    pub electrons: i32,

    /// Forward rate constant, or standard potential for electrochemical
    /// reactions
    pub forward: Expression,

    /// Backward rate constant, or standard rate constant for
    /// electrochemical reactions
    pub backward: Option<Expression>,
}

impl Reaction {
    pub fn is_electrochemical(&self) -> bool {
        self.electrons != 0
    }
}

/// Bound rate expressions of one reaction.
#[derive(Debug, Clone)]
struct BoundRates {
    forward: Expression,
    backward: Option<Expression>,
}

#[derive(Debug, Clone, Default)]
pub struct KineticSystem {
    species: Vec<Species>,
    reactions: Vec<Reaction>,
    species_lookup: HashMap<String, usize>,

    parameters: Vec<String>,
    bound: Vec<BoundRates>,
    steady_state: bool,
}

struct ParsedReaction<'a> {
    left: Vec<(u32, String)>,
    arrow: &'a str,
    forward: &'a str,
    backward: Option<&'a str>,
    right: Vec<(u32, String)>,
}

fn species_term(input: &str) -> IResult<&str, (u32, String)> {
    (
        multispace0,
        opt(terminated(map_res(digit1, str::parse::<u32>), multispace0)),
        alt((tag("e-").map(|s: &str| s.to_string()), identifier)),
        multispace0,
    )
        .map(|(_, count, name, _)| (count.unwrap_or(1), name))
        .parse(input)
}

fn reaction_side(input: &str) -> IResult<&str, Vec<(u32, String)>> {
    separated_list1(|i| spaced('+', i), species_term).parse(input)
}

fn bracketed(input: &str) -> IResult<&str, &str> {
    delimited(char('['), take_until("]"), char(']')).parse(input)
}

fn reaction_line(input: &str) -> IResult<&str, ParsedReaction<'_>> {
    (
        reaction_side,
        alt((tag("<=>"), tag("->"))),
        bracketed,
        opt(bracketed),
        reaction_side,
    )
        .map(|(left, arrow, forward, backward, right)| ParsedReaction {
            left,
            arrow,
            forward,
            backward,
            right,
        })
        .parse(input)
}

impl KineticSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a system from reaction lines; `#` starts a comment.
    pub fn parse(text: &str) -> Result<Self> {
        let mut system = Self::new();
        system.parse_reactions(text)?;
        Ok(system)
    }

    /// Adds the reactions described by `text`.
    ///
    /// # Errors
    ///
    /// * `FitError::InvalidInput` with the line number for malformed lines
    /// * `FitError::Expression` for malformed rate expressions
    pub fn parse_reactions(&mut self, text: &str) -> Result<()> {
        for (number, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let invalid = |why: &str| {
                FitError::InvalidInput(format!("line {}: {}: '{}'", number + 1, why, line))
            };
            let parsed = match reaction_line(line) {
                Ok((rest, parsed)) if rest.trim().is_empty() => parsed,
                Ok((rest, _)) => return Err(invalid(&format!("unexpected '{}'", rest))),
                Err(_) => return Err(invalid("could not parse reaction")),
            };
            match (parsed.arrow, parsed.backward) {
                ("<=>", None) => return Err(invalid("reversible reaction needs two rates")),
                ("->", Some(_)) => return Err(invalid("irreversible reaction takes one rate")),
                _ => {}
            }

            let mut species = Vec::new();
            for (count, name) in parsed.left {
                species.push((name, -(count as i32)));
            }
            for (count, name) in parsed.right {
                species.push((name, count as i32));
            }
            let refs: Vec<(&str, i32)> = species.iter().map(|(n, c)| (n.as_str(), *c)).collect();
            self.add_reaction(&refs, parsed.forward, parsed.backward)?;
        }
        Ok(())
    }

    fn species_index_or_insert(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.species_lookup.get(name) {
            return idx;
        }
        let idx = self.species.len();
        self.species.push(Species {
            name: name.to_string(),
            reactions: Vec::new(),
        });
        self.species_lookup.insert(name.to_string(), idx);
        idx
    }

    /// Adds a reaction. Stoichiometric coefficients are negative for
    /// reactants; the species `e-` denotes electrons.
    ///
    /// # Errors
    ///
    /// * `FitError::InvalidInput` for an electrochemical reaction without a
    ///   backward (rate constant) expression
    pub fn add_reaction(
        &mut self,
        species: &[(&str, i32)],
        forward: &str,
        backward: Option<&str>,
    ) -> Result<()> {
        let forward = Expression::parse(forward)?;
        let backward = backward.map(Expression::parse).transpose()?;
        let electrons: i32 = -species
            .iter()
            .filter(|(name, _)| *name == "e-")
            .map(|(_, c)| *c)
            .sum::<i32>();
        if electrons != 0 && backward.is_none() {
            return Err(FitError::InvalidInput(
                "electrochemical reactions need a standard potential and a rate constant"
                    .to_string(),
            ));
        }

        let index = self.reactions.len();
        let mut reaction = Reaction {
            species: Vec::new(),
            stoichiometry: Vec::new(),
            electrons,
            forward,
            backward,
        };
        for (name, count) in species.iter().filter(|(name, _)| *name != "e-") {
            let spi = self.species_index_or_insert(name);
            self.species[spi].reactions.push(index);
            reaction.species.push(spi);
            reaction.stoichiometry.push(*count);
        }
        self.reactions.push(reaction);
        self.rebuild()
    }

    /// Adds the `c_tot` parameter, and `e` and `temperature` if needed, for
    /// steady-state computations.
    pub fn prepare_for_steady_state(&mut self) -> Result<()> {
        self.steady_state = true;
        self.rebuild()
    }

    /// Collects the parameter names and binds the rate expressions to them.
    fn rebuild(&mut self) -> Result<()> {
        let mut names: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        };
        for r in &self.reactions {
            r.forward.variables().iter().for_each(|v| push(v));
            if let Some(b) = &r.backward {
                b.variables().iter().for_each(|v| push(v));
            }
        }
        for s in &self.species {
            push(&format!("c0_{}", s.name));
        }
        if self.steady_state || self.reactions.iter().any(Reaction::is_electrochemical) {
            push("e");
            push("temperature");
        }
        if self.steady_state {
            push("c_tot");
        }

        let lookup = |name: &str| names.iter().position(|n| n == name);
        self.bound = self
            .reactions
            .iter()
            .map(|r| {
                Ok(BoundRates {
                    forward: r.forward.bind(&lookup)?,
                    backward: r.backward.as_ref().map(|b| b.bind(&lookup)).transpose()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!("kinetic system parameters: {}", names.join(", "));
        self.parameters = names;
        Ok(())
    }

    pub fn species(&self) -> &[Species] {
        &self.species
    }

    pub fn species_count(&self) -> usize {
        self.species.len()
    }

    pub fn species_index(&self, name: &str) -> Option<usize> {
        self.species_lookup.get(name).copied()
    }

    pub fn reactions(&self) -> &[Reaction] {
        &self.reactions
    }

    /// Names of all parameters, in the order used by parameter slices.
    pub fn all_parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|n| n == name)
    }

    fn check_parameters(&self, parameters: &[f64]) -> Result<()> {
        if parameters.len() != self.parameters.len() {
            return Err(FitError::DimensionMismatch(format!(
                "expected {} parameters, got {}",
                self.parameters.len(),
                parameters.len()
            )));
        }
        Ok(())
    }

    /// Writes the `c0_*` parameters into `target`.
    pub fn initial_concentrations(
        &self,
        parameters: &[f64],
        mut target: ArrayViewMut1<'_, f64>,
    ) -> Result<()> {
        self.check_parameters(parameters)?;
        if target.len() != self.species.len() {
            return Err(FitError::DimensionMismatch(format!(
                "target has {} entries for {} species",
                target.len(),
                self.species.len()
            )));
        }
        for (i, s) in self.species.iter().enumerate() {
            let name = format!("c0_{}", s.name);
            let idx = self
                .parameter_index(&name)
                .ok_or_else(|| FitError::ParameterNotFound(name.clone()))?;
            target[i] = parameters[idx];
        }
        Ok(())
    }

    /// Forward and backward rate constants of reaction `r`.
    fn rate_constants(&self, r: usize, parameters: &[f64]) -> Result<(f64, f64)> {
        let reaction = &self.reactions[r];
        let rates = &self.bound[r];
        let values = SlotValues(parameters);
        let forward = rates.forward.evaluate(&values)?;
        let backward = match &rates.backward {
            Some(b) => b.evaluate(&values)?,
            None => 0.0,
        };
        if !reaction.is_electrochemical() {
            return Ok((forward, backward));
        }

        let slot = |name: &str| {
            self.parameter_index(name)
                .map(|i| parameters[i])
                .ok_or_else(|| FitError::ParameterNotFound(name.to_string()))
        };
        let f = FARADAY / (GAS_CONSTANT * slot("temperature")?);
        let overpotential = slot("e")? - forward;
        let n = reaction.electrons as f64;
        let k0 = backward;
        Ok((
            k0 * (-ALPHA * n * f * overpotential).exp(),
            k0 * ((1.0 - ALPHA) * n * f * overpotential).exp(),
        ))
    }

    /// Computes the time derivatives of the concentrations into `target`
    /// (when given) and returns the current, counted as electrons consumed
    /// per unit time.
    pub fn compute_derivatives(
        &self,
        concentrations: ArrayView1<'_, f64>,
        parameters: &[f64],
        target: Option<ArrayViewMut1<'_, f64>>,
    ) -> Result<f64> {
        self.check_parameters(parameters)?;
        let n = self.species.len();
        if concentrations.len() != n {
            return Err(FitError::DimensionMismatch(format!(
                "got {} concentrations for {} species",
                concentrations.len(),
                n
            )));
        }
        let mut target = target;
        if let Some(t) = target.as_mut() {
            if t.len() != n {
                return Err(FitError::DimensionMismatch(format!(
                    "target has {} entries for {} species",
                    t.len(),
                    n
                )));
            }
            t.fill(0.0);
        }

        let mut current = 0.0;
        for (r, reaction) in self.reactions.iter().enumerate() {
            let (kf, kb) = self.rate_constants(r, parameters)?;
            let mut forward = kf;
            let mut backward = kb;
            for (&s, &nu) in reaction.species.iter().zip(&reaction.stoichiometry) {
                let c = concentrations[s].powi(nu.abs());
                if nu < 0 {
                    forward *= c;
                } else {
                    backward *= c;
                }
            }
            let rate = forward - backward;
            if let Some(t) = target.as_mut() {
                for (&s, &nu) in reaction.species.iter().zip(&reaction.stoichiometry) {
                    t[s] += nu as f64 * rate;
                }
            }
            current += reaction.electrons as f64 * rate;
        }
        Ok(current)
    }
}

fn format_side(system: &KineticSystem, reaction: &Reaction, products: bool) -> String {
    let mut terms: Vec<String> = reaction
        .species
        .iter()
        .zip(&reaction.stoichiometry)
        .filter(|&(_, &nu)| (nu > 0) == products)
        .map(|(&s, &nu)| match nu.abs() {
            1 => system.species[s].name.clone(),
            c => format!("{} {}", c, system.species[s].name),
        })
        .collect();
    let electrons = if products {
        -reaction.electrons
    } else {
        reaction.electrons
    };
    match electrons {
        e if e <= 0 => {}
        1 => terms.push("e-".to_string()),
        e => terms.push(format!("{} e-", e)),
    }
    terms.join(" + ")
}

impl fmt::Display for KineticSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.reactions {
            write!(f, "{} ", format_side(self, r, false))?;
            match &r.backward {
                Some(b) => write!(f, "<=>[{}][{}]", r.forward, b)?,
                None => write!(f, "->[{}]", r.forward)?,
            }
            writeln!(f, " {}", format_side(self, r, true))?;
        }
        Ok(())
    }
}
