//! Linear contextual Thompson Sampling (§4.2). One posterior per arm, shared
//! across tickers — the context vector is what carries ticker-specific signal.
//! Samples a multivariate Gaussian per arm over a shared context, the
//! contextual generalization of a per-arm Beta-posterior bandit.

use std::collections::HashMap;
use std::hash::Hasher;
use std::path::{Path, PathBuf};

use nalgebra::{Cholesky, DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::api::Arm;
use crate::errors::AppResult;
use crate::storage::snapshot;

/// `A_k` / `b_k` sufficient statistics for one arm's posterior over the linear
/// reward model `r = x^T theta_k + noise`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArmPosterior {
    a: Vec<Vec<f64>>,
    b: Vec<f64>,
}

impl ArmPosterior {
    fn init(dim: usize, lambda: f64) -> Self {
        let mut a = vec![vec![0.0; dim]; dim];
        for (i, row) in a.iter_mut().enumerate() {
            row[i] = lambda;
        }
        Self { a, b: vec![0.0; dim] }
    }

    fn a_matrix(&self) -> DMatrix<f64> {
        let dim = self.b.len();
        DMatrix::from_fn(dim, dim, |r, c| self.a[r][c])
    }

    fn b_vector(&self) -> DVector<f64> {
        DVector::from_row_slice(&self.b)
    }

    fn set(&mut self, a: &DMatrix<f64>, b: &DVector<f64>) {
        let dim = self.b.len();
        for r in 0..dim {
            for c in 0..dim {
                self.a[r][c] = a[(r, c)];
            }
            self.b[r] = b[r];
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BanditSnapshot {
    dim: usize,
    lambda: f64,
    arms: HashMap<String, ArmPosterior>,
}

/// A decision's bandit selection plus the posterior mean score it was picked on,
/// useful for `analysis.strategy.reason` and for debugging arm dominance.
pub struct Selection {
    pub arm: Arm,
    pub scores: HashMap<Arm, f64>,
}

struct Inner {
    dim: usize,
    lambda: f64,
    nu: f64,
    arms: HashMap<Arm, ArmPosterior>,
}

/// Shared, mutex-guarded bandit state for one context dimension. Deployments pin
/// a single `D` via `CONTEXT_DIM`, so in practice one `Bandit` exists per process.
pub struct Bandit {
    inner: Mutex<Inner>,
    snapshot_path: PathBuf,
}

impl Bandit {
    pub fn load_or_init(snapshot_path: PathBuf, dim: usize, lambda: f64, nu: f64) -> AppResult<Self> {
        let loaded: Option<BanditSnapshot> = snapshot::load(&snapshot_path)?;
        let arms = match loaded {
            Some(snap) if snap.dim == dim => snap
                .arms
                .into_iter()
                .filter_map(|(k, v)| Arm::from_str_loose(&k).map(|arm| (arm, v)))
                .collect(),
            _ => Arm::ALL
                .into_iter()
                .map(|arm| (arm, ArmPosterior::init(dim, lambda)))
                .collect(),
        };
        Ok(Self {
            inner: Mutex::new(Inner { dim, lambda, nu, arms }),
            snapshot_path,
        })
    }

    pub async fn select(&self, context: &[f64], decision_id: &str) -> AppResult<Selection> {
        let inner = self.inner.lock().await;
        debug_assert_eq!(context.len(), inner.dim, "context length must match bandit dimension");
        let x = DVector::from_row_slice(context);
        let mut rng = seeded_rng(decision_id);
        let mut scores = HashMap::new();
        for arm in Arm::ALL {
            let post = &inner.arms[&arm];
            let a = post.a_matrix();
            let b = post.b_vector();
            let (mu, sigma) = posterior(&a, &b, inner.nu);
            let theta = sample_mvn(&mu, &sigma, &mut rng);
            scores.insert(arm, theta.dot(&x));
        }
        // `max_by` keeps the *last* maximal element on a tie; the tie-break order
        // is the first arm in `Arm::ALL` (§4.2), so fold manually and only
        // replace the incumbent on a strictly greater score.
        let mut best = Arm::ALL[0];
        let mut best_score = scores[&best];
        for arm in &Arm::ALL[1..] {
            if scores[arm] > best_score {
                best = *arm;
                best_score = scores[arm];
            }
        }
        Ok(Selection { arm: best, scores })
    }

    pub async fn update(&self, context: &[f64], arm: Arm, reward: f64) -> AppResult<()> {
        let reward = reward.clamp(-1.0, 1.0);
        let mut inner = self.inner.lock().await;
        debug_assert_eq!(context.len(), inner.dim, "context length must match bandit dimension");
        let x = DVector::from_row_slice(context);
        let post = inner.arms.get_mut(&arm).expect("all arms pre-initialized");
        let mut a = post.a_matrix();
        let mut b = post.b_vector();
        a += &x * x.transpose();
        // Symmetrize: floating point drift can leave A_k asymmetric after repeated
        // rank-1 updates, which breaks the Cholesky factorization downstream.
        a = (&a + a.transpose()) * 0.5;
        b += reward * &x;
        post.set(&a, &b);
        let snap = BanditSnapshot {
            dim: inner.dim,
            lambda: inner.lambda,
            arms: inner
                .arms
                .iter()
                .map(|(arm, post)| (arm.as_str().to_string(), post.clone()))
                .collect(),
        };
        drop(inner);
        snapshot::save(&self.snapshot_path, &snap)
    }
}

/// `mu = A^-1 b`, `Sigma = nu^2 A^-1`, falling back to `A + eps*I` when `A` isn't
/// numerically positive-definite (can happen after many rank-1 updates).
fn posterior(a: &DMatrix<f64>, b: &DVector<f64>, nu: f64) -> (DVector<f64>, DMatrix<f64>) {
    let dim = a.nrows();
    let mut eps = 0.0;
    for _ in 0..4 {
        let regularized = if eps == 0.0 {
            a.clone()
        } else {
            a + DMatrix::identity(dim, dim) * eps
        };
        if let Some(chol) = Cholesky::new(regularized.clone()) {
            let a_inv = chol.inverse();
            let mu = &a_inv * b;
            let sigma = &a_inv * (nu * nu);
            return (mu, sigma);
        }
        eps = if eps == 0.0 { 1e-6 } else { eps * 10.0 };
    }
    // Should be unreachable in practice (A starts at lambda*I with lambda > 0 and
    // only accumulates positive-semidefinite rank-1 terms); fall back to a flat
    // prior rather than panicking.
    (DVector::zeros(dim), DMatrix::identity(dim, dim) * (nu * nu))
}

fn sample_mvn(mu: &DVector<f64>, sigma: &DMatrix<f64>, rng: &mut StdRng) -> DVector<f64> {
    let dim = mu.len();
    let l = match Cholesky::new(sigma.clone()) {
        Some(c) => c.l(),
        None => DMatrix::identity(dim, dim) * sigma.diagonal().amax().max(1e-12).sqrt(),
    };
    let z = DVector::from_fn(dim, |_, _| standard_normal(rng));
    mu + l * z
}

fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.random::<f64>().max(1e-12);
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

/// Deterministic per-decision seed: replaying `select` for the same
/// `decision_id` and posterior state reproduces the same arm (§4.2's replay
/// determinism requirement), without threading an RNG through every call site.
fn seeded_rng(decision_id: &str) -> StdRng {
    let mut hasher = FxHasher::default();
    hasher.write(decision_id.as_bytes());
    StdRng::seed_from_u64(hasher.finish())
}
