use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Size of an octave in semitones.
pub const OCTAVE: f64 = 12.0;

/// Tolerance used when deciding whether an interval is exactly zero or an octave.
const EPSILON: f64 = 1e-9;

/// Operands further than this many moduli from zero fold in floating point.
const MAX_FOLD_STEPS: f64 = 4096.0;

/// A pitch offset, kept in whichever form it was written in.
///
/// Arithmetic preserves the representation whenever both operands agree on it
/// (two ratios, two steps of the same EDO) and falls back to floating semitones otherwise.
/// Equality is structural: `Ratio(2, 1)` and `Semitone(12.0)` are different values even
/// though they sound the same.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum Interval {
    /// A raw floating point offset in semitones.
    Semitone(f64),

    /// A just frequency ratio `num/den`, kept in lowest terms after arithmetic.
    Ratio(i64, i64),

    /// `steps` out of `edo` equal divisions of an interval `base` semitones wide.
    EdoStep(f64, i64, i64),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntervalParseError {
    #[error("Empty interval")]
    Empty,

    #[error("Invalid number '{0}' in interval")]
    InvalidNumber(String),

    #[error("Ratio '{0}' must have positive terms")]
    NonPositiveRatio(String),

    #[error("EDO step '{0}' must divide the octave into at least one step")]
    ZeroDivisions(String),
}

impl Default for Interval {
    fn default() -> Self {
        Interval::Semitone(0.0)
    }
}

impl Interval {
    pub fn semitones(&self) -> f64 {
        match *self {
            Interval::Semitone(semitones) => semitones,
            Interval::Ratio(num, den) => OCTAVE * (num as f64 / den as f64).log2(),
            Interval::EdoStep(base, steps, edo) => base * steps as f64 / edo as f64,
        }
    }

    /// The interval's size folded into `[0, octave)`.
    pub fn class(&self, octave: f64) -> f64 {
        let semitones = self.semitones();
        if octave == 0.0 {
            return semitones;
        }

        fold(semitones, octave)
    }

    pub fn add(&self, other: &Interval) -> Interval {
        // Zero and octave shifts keep exact intervals exact, whichever side they are on.
        if let Some(shifted) = self.shift_exact(other).or_else(|| other.shift_exact(self)) {
            return shifted;
        }

        match (*self, *other) {
            (Interval::EdoStep(base, a, edo), Interval::EdoStep(other_base, b, other_edo))
                if base == other_base && edo == other_edo =>
            {
                match a.checked_add(b) {
                    Some(steps) => Interval::EdoStep(base, steps, edo),
                    None => self.add_semitones(other),
                }
            }
            (Interval::Ratio(n1, d1), Interval::Ratio(n2, d2)) => {
                match (n1.checked_mul(n2), d1.checked_mul(d2)) {
                    (Some(num), Some(den)) => {
                        let (num, den) = reduce(num, den);
                        Interval::Ratio(num, den)
                    }
                    _ => self.add_semitones(other),
                }
            }
            _ => self.add_semitones(other),
        }
    }

    pub fn invert(&self) -> Interval {
        self.multiply(-1)
    }

    pub fn multiply(&self, n: i64) -> Interval {
        match *self {
            Interval::Semitone(semitones) => Interval::Semitone(semitones * n as f64),
            Interval::EdoStep(base, steps, edo) => match steps.checked_mul(n) {
                Some(steps) => Interval::EdoStep(base, steps, edo),
                None => Interval::Semitone(self.semitones() * n as f64),
            },
            Interval::Ratio(num, den) => {
                let (num, den) = if n < 0 { (den, num) } else { (num, den) };
                let powered = u32::try_from(n.unsigned_abs())
                    .ok()
                    .and_then(|power| Some((num.checked_pow(power)?, den.checked_pow(power)?)));

                match powered {
                    Some((num, den)) => {
                        let (num, den) = reduce(num, den);
                        Interval::Ratio(num, den)
                    }
                    None => Interval::Semitone(self.semitones() * n as f64),
                }
            }
        }
    }

    /// Folds `self` into `[0, |other|)` by repeatedly adding or subtracting `other`,
    /// so octave-sized moduli keep ratios and EDO steps exact.
    pub fn modulo(&self, other: &Interval) -> Interval {
        let size = other.semitones();
        if size == 0.0 || !size.is_finite() || !self.semitones().is_finite() {
            return *self;
        }

        let (step, size) = if size < 0.0 {
            (other.invert(), -size)
        } else {
            (*other, size)
        };

        match (*self, step) {
            (Interval::Semitone(semitones), _) => return Interval::Semitone(fold(semitones, size)),
            (Interval::EdoStep(base, steps, edo), Interval::EdoStep(step_base, modulus, step_edo))
                if base == step_base && edo == step_edo && edo > 0 && modulus > 0 =>
            {
                return Interval::EdoStep(base, steps.rem_euclid(modulus), edo);
            }
            (Interval::EdoStep(base, steps, edo), _)
                if edo > 0 && (base - OCTAVE).abs() < EPSILON && (size - OCTAVE).abs() < EPSILON =>
            {
                return Interval::EdoStep(base, steps.rem_euclid(edo), edo);
            }
            _ => {}
        }

        if (self.semitones() / size).abs() > MAX_FOLD_STEPS {
            return Interval::Semitone(fold(self.semitones(), size));
        }

        let back = step.invert();
        let mut result = *self;
        while result.semitones() < 0.0 {
            result = result.add(&step);
        }
        while result.semitones() >= size {
            result = result.add(&back);
        }

        result
    }

    fn add_semitones(&self, other: &Interval) -> Interval {
        Interval::Semitone(self.semitones() + other.semitones())
    }

    /// Shifts an exact interval by `shift` when `shift` is zero or a whole octave.
    fn shift_exact(&self, shift: &Interval) -> Option<Interval> {
        let amount = shift.semitones();
        let octaves: i64 = if amount.abs() < EPSILON {
            0
        } else if (amount - OCTAVE).abs() < EPSILON {
            1
        } else if (amount + OCTAVE).abs() < EPSILON {
            -1
        } else {
            return None;
        };

        match *self {
            Interval::Ratio(num, den) => {
                let (num, den) = match octaves {
                    1 => (num.checked_mul(2)?, den),
                    -1 => (num, den.checked_mul(2)?),
                    _ => (num, den),
                };
                let (num, den) = reduce(num, den);
                Some(Interval::Ratio(num, den))
            }
            Interval::EdoStep(..) if octaves == 0 => Some(*self),
            Interval::EdoStep(base, steps, edo) if base == OCTAVE => {
                let steps = steps.checked_add(edo.checked_mul(octaves)?)?;
                Some(Interval::EdoStep(base, steps, edo))
            }
            _ => None,
        }
    }
}

/// Brings a fraction to lowest terms. Fractions with a zero or negative term are returned
/// as they are.
pub fn reduce(num: i64, den: i64) -> (i64, i64) {
    if num <= 0 || den <= 0 {
        return (num, den);
    }

    let divisor = gcd(num, den);
    (num / divisor, den / divisor)
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Interval::Ratio(num, den) => write!(f, "{}/{}", num, den),
            Interval::EdoStep(base, steps, edo) if base == OCTAVE => {
                write!(f, "{}\\{}", steps, edo)
            }
            _ => write!(f, "{:.6}", self.semitones()),
        }
    }
}

impl FromStr for Interval {
    type Err = IntervalParseError;

    /// Accepts `num/den`, `steps\edo` (octave-based EDO) or a floating semitone count.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IntervalParseError::Empty);
        }

        let int = |part: &str| {
            part.trim()
                .parse::<i64>()
                .map_err(|_| IntervalParseError::InvalidNumber(part.trim().to_owned()))
        };

        if let Some((num, den)) = s.split_once('/') {
            let (num, den) = (int(num)?, int(den)?);
            if num <= 0 || den <= 0 {
                return Err(IntervalParseError::NonPositiveRatio(s.to_owned()));
            }

            let (num, den) = reduce(num, den);
            return Ok(Interval::Ratio(num, den));
        }

        if let Some((steps, edo)) = s.split_once('\\') {
            let (steps, edo) = (int(steps)?, int(edo)?);
            if edo <= 0 {
                return Err(IntervalParseError::ZeroDivisions(s.to_owned()));
            }

            return Ok(Interval::EdoStep(OCTAVE, steps, edo));
        }

        match s.parse::<f64>() {
            Ok(semitones) if semitones.is_finite() => Ok(Interval::Semitone(semitones)),
            _ => Err(IntervalParseError::InvalidNumber(s.to_owned())),
        }
    }
}

/// `value.rem_euclid(size)`, kept strictly below `|size|` when rounding lands on it.
fn fold(value: f64, size: f64) -> f64 {
    let folded = value.rem_euclid(size);
    if folded >= size.abs() { 0.0 } else { folded }
}
