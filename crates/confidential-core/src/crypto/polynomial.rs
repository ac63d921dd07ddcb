//! Polynomials over the secp256k1 scalar field

use crate::types::{Share, ShareholderId};
use crate::{Error, Result};
use k256::{
    elliptic_curve::{sec1::ToEncodedPoint, Field},
    ProjectivePoint, Scalar,
};
use rand_core::RngCore;

/// Polynomial `a_0 + a_1 x + ... + a_d x^d`
#[derive(Clone)]
pub struct Polynomial {
    coefficients: Vec<Scalar>,
}

impl Polynomial {
    /// Random polynomial of the given degree with a fixed constant term
    pub fn random(degree: usize, constant: Scalar, rng: &mut dyn RngCore) -> Self {
        let mut coefficients = Vec::with_capacity(degree + 1);
        coefficients.push(constant);
        for _ in 0..degree {
            coefficients.push(Scalar::random(&mut *rng));
        }
        Self { coefficients }
    }

    /// Random polynomial of the given degree that evaluates to zero at every root
    pub fn random_with_roots(degree: usize, roots: &[Scalar], rng: &mut dyn RngCore) -> Result<Self> {
        if roots.len() > degree {
            return Err(Error::InvalidConfig(format!(
                "Cannot fix {} roots on a polynomial of degree {}",
                roots.len(),
                degree
            )));
        }

        let leading = Scalar::random(&mut *rng);
        let free = Self::random(degree - roots.len(), leading, rng);
        let mut coefficients = free.coefficients;
        for root in roots {
            // multiply by (x - root)
            let mut next = vec![Scalar::ZERO; coefficients.len() + 1];
            for (i, coef) in coefficients.iter().enumerate() {
                next[i + 1] += coef;
                next[i] -= *coef * root;
            }
            coefficients = next;
        }
        Ok(Self { coefficients })
    }

    pub fn degree(&self) -> usize {
        self.coefficients.len() - 1
    }

    pub fn constant(&self) -> Scalar {
        self.coefficients[0]
    }

    /// Evaluate with Horner's rule
    pub fn evaluate(&self, x: &Scalar) -> Scalar {
        let mut result = Scalar::ZERO;
        for coef in self.coefficients.iter().rev() {
            result = result * x + coef;
        }
        result
    }

    pub fn share_for(&self, shareholder: ShareholderId) -> Share {
        Share::new(shareholder, self.evaluate(&shareholder.to_scalar()))
    }

    /// Feldman commitments `g^{a_k}`, compressed
    pub fn commitments(&self) -> Vec<Vec<u8>> {
        self.coefficients
            .iter()
            .map(|coef| {
                (ProjectivePoint::GENERATOR * coef)
                    .to_affine()
                    .to_encoded_point(true)
                    .as_bytes()
                    .to_vec()
            })
            .collect()
    }
}

/// Lagrange interpolation of the polynomial through `shares`, evaluated at `at`
pub fn interpolate(shares: &[Share], at: &Scalar) -> Result<Scalar> {
    if shares.is_empty() {
        return Err(Error::Crypto("Cannot interpolate without shares".into()));
    }

    let mut result = Scalar::ZERO;
    for (i, share_i) in shares.iter().enumerate() {
        let x_i = share_i.shareholder.to_scalar();
        let mut numerator = Scalar::ONE;
        let mut denominator = Scalar::ONE;

        for (j, share_j) in shares.iter().enumerate() {
            if i == j {
                continue;
            }
            let x_j = share_j.shareholder.to_scalar();
            numerator *= *at - x_j;
            denominator *= x_i - x_j;
        }

        let inverse = Option::<Scalar>::from(denominator.invert()).ok_or_else(|| {
            Error::Crypto(format!(
                "Duplicate shareholder {} in interpolation set",
                share_i.shareholder
            ))
        })?;
        result += share_i.value * numerator * inverse;
    }

    Ok(result)
}
