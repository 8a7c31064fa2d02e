//! 非線形最小二乗（Levenberg–Marquardt）

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn};

/// 残差ベクトルを持つ最小二乗問題
///
/// ヤコビアンは既定で中心差分。構造が分かっている問題は上書きする。
pub trait NllsProblem {
    fn residuals(&self, x: &DVector<f64>) -> DVector<f64>;

    fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        numeric_jacobian(|p| self.residuals(p), x)
    }
}

/// 中心差分ヤコビアン
pub fn numeric_jacobian<F>(f: F, x: &DVector<f64>) -> DMatrix<f64>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    let m = f(x).len();
    let mut jac = DMatrix::zeros(m, x.len());
    let mut xp = x.clone();
    for j in 0..x.len() {
        let h = 1e-6 * x[j].abs().max(1.0);
        let orig = xp[j];
        xp[j] = orig + h;
        let rp = f(&xp);
        xp[j] = orig - h;
        let rm = f(&xp);
        xp[j] = orig;
        jac.set_column(j, &((rp - rm) / (2.0 * h)));
    }
    jac
}

#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
    /// 評価回数上限の係数（パラメータ数+1 倍）
    pub patience: usize,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            ftol: 1e-12,
            xtol: 1e-12,
            gtol: 1e-12,
            patience: 50,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SolveReport {
    pub evaluations: usize,
    /// 0.5 * Σ r²
    pub final_cost: f64,
    pub converged: bool,
}

struct LmWrapper<'a, P: NllsProblem> {
    problem: &'a P,
    params: DVector<f64>,
}

impl<'a, P: NllsProblem> LeastSquaresProblem<f64, Dyn, Dyn> for LmWrapper<'a, P> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let r = self.problem.residuals(&self.params);
        r.iter().all(|v| v.is_finite()).then_some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let j = self.problem.jacobian(&self.params);
        j.iter().all(|v| v.is_finite()).then_some(j)
    }
}

pub fn solve<P: NllsProblem>(problem: &P, x0: DVector<f64>, opts: &SolveOptions) -> (DVector<f64>, SolveReport) {
    let lm = LevenbergMarquardt::new()
        .with_ftol(opts.ftol)
        .with_xtol(opts.xtol)
        .with_gtol(opts.gtol)
        .with_patience(opts.patience.max(1));

    let wrapper = LmWrapper { problem, params: x0 };
    let (wrapper, report) = lm.minimize(wrapper);

    (
        wrapper.params(),
        SolveReport {
            evaluations: report.number_of_evaluations,
            final_cost: report.objective_function,
            converged: report.termination.was_successful(),
        },
    )
}

/// 0.5 * Σ r²
pub fn cost<P: NllsProblem>(problem: &P, x: &DVector<f64>) -> f64 {
    0.5 * problem.residuals(x).norm_squared()
}
