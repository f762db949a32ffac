//! Dense linear algebra for small symmetric positive definite systems.
//!
//! Candle has no native Cholesky or triangular solve, so both are
//! written with `narrow`, `matmul` and `cat`. Everything stays on the
//! autograd tape and gradients flow back into kernel hyperparameters
//! and inducing locations. Each call costs O(m) small ops, which is
//! fine for inducing-point sized matrices.

use crate::gp_error::{GpError, Result};
use candle_core::{DType, Device, Tensor, D};
use log::warn;

/// Pivots below `PIVOT_RTOL * max(diag(K))` are treated as singular.
pub const PIVOT_RTOL: f64 = 1e-10;

/// Lower Cholesky factor `L` with `L Lᵀ = K`.
///
/// Fails with [`GpError::NotPositiveDefinite`] instead of returning
/// NaNs when a pivot is non-finite or below tolerance.
///
/// * `k_mm` - symmetric positive definite matrix (m x m)
pub fn cholesky(k_mm: &Tensor) -> Result<Tensor> {
    let (m, m2) = k_mm.dims2()?;
    if m != m2 || m == 0 {
        return Err(GpError::ShapeMismatch {
            context: "cholesky",
            expected: "non-empty square matrix".into(),
            got: format!("{} x {}", m, m2),
        });
    }

    let tril_mm = Tensor::tril2(m, k_mm.dtype(), k_mm.device())?;

    let mut l_mj: Option<Tensor> = None;
    let mut pivots = Vec::with_capacity(m);

    for j in 0..m {
        let k_m1 = k_mm.narrow(1, j, 1)?;

        // residual column: K[:, j] - L[:, :j] L[j, :j]ᵀ
        let resid_m1 = match &l_mj {
            None => k_m1,
            Some(l_prev) => {
                let l_row = l_prev.narrow(0, j, 1)?;
                let proj_m1 = l_prev.broadcast_mul(&l_row)?.sum_keepdim(1)?;
                (k_m1 - proj_m1)?
            }
        };

        let pivot = resid_m1.narrow(0, j, 1)?;
        let col_m1 = resid_m1
            .broadcast_div(&pivot.sqrt()?)?
            .mul(&tril_mm.narrow(1, j, 1)?)?;
        pivots.push(pivot);

        l_mj = Some(match l_mj {
            None => col_m1,
            Some(l_prev) => Tensor::cat(&[&l_prev, &col_m1], 1)?,
        });
    }

    check_pivots(k_mm, &pivots)?;

    l_mj.ok_or(GpError::NonFinite("cholesky factor"))
}

fn check_pivots(k_mm: &Tensor, pivots: &[Tensor]) -> Result<()> {
    let pivots = to_host_vec(&Tensor::cat(pivots, 0)?.flatten_all()?)?;
    let kdiag = to_host_vec(&diag(k_mm)?)?;

    let scale = kdiag.iter().fold(0_f64, |acc, &x| acc.max(x.abs()));
    if !scale.is_finite() {
        return Err(GpError::NonFinite("kernel matrix diagonal"));
    }
    let tolerance = PIVOT_RTOL * scale.max(f64::MIN_POSITIVE);

    for (row, &pivot) in pivots.iter().enumerate() {
        if !pivot.is_finite() || pivot <= tolerance {
            warn!("cholesky: pivot {:e} at row {} of {}", pivot, row, pivots.len());
            return Err(GpError::NotPositiveDefinite {
                row,
                pivot,
                tolerance,
            });
        }
    }
    Ok(())
}

/// Solve `L X = B` by forward substitution.
///
/// * `l_mm` - lower triangular (m x m)
/// * `b_mn` - right-hand side (m x n)
pub fn solve_lower(l_mm: &Tensor, b_mn: &Tensor) -> Result<Tensor> {
    let m = check_system("solve_lower", l_mm, b_mn)?;

    let mut x_rows: Vec<Tensor> = Vec::with_capacity(m);
    for i in 0..m {
        let b_1n = b_mn.narrow(0, i, 1)?;
        let l_ii = l_mm.narrow(0, i, 1)?.narrow(1, i, 1)?;
        let r_1n = if i == 0 {
            b_1n
        } else {
            let x_in = Tensor::cat(&x_rows, 0)?;
            let l_1i = l_mm.narrow(0, i, 1)?.narrow(1, 0, i)?.contiguous()?;
            (b_1n - l_1i.matmul(&x_in)?)?
        };
        x_rows.push(r_1n.broadcast_div(&l_ii)?);
    }
    Ok(Tensor::cat(&x_rows, 0)?)
}

/// Solve `Lᵀ X = B` by back substitution, reading the upper
/// triangle from the columns of `L`.
///
/// * `l_mm` - lower triangular (m x m)
/// * `b_mn` - right-hand side (m x n)
pub fn solve_lower_transpose(l_mm: &Tensor, b_mn: &Tensor) -> Result<Tensor> {
    let m = check_system("solve_lower_transpose", l_mm, b_mn)?;

    // rows i+1..m of X, in order
    let mut x_rows: Vec<Tensor> = Vec::with_capacity(m);
    for i in (0..m).rev() {
        let b_1n = b_mn.narrow(0, i, 1)?;
        let l_ii = l_mm.narrow(0, i, 1)?.narrow(1, i, 1)?;
        let r_1n = if i == m - 1 {
            b_1n
        } else {
            let x_tail = Tensor::cat(&x_rows, 0)?;
            let u_1t = l_mm
                .narrow(0, i + 1, m - i - 1)?
                .narrow(1, i, 1)?
                .t()?
                .contiguous()?;
            (b_1n - u_1t.matmul(&x_tail)?)?
        };
        x_rows.insert(0, r_1n.broadcast_div(&l_ii)?);
    }
    Ok(Tensor::cat(&x_rows, 0)?)
}

fn check_system(context: &'static str, l_mm: &Tensor, b_mn: &Tensor) -> Result<usize> {
    let (m, m2) = l_mm.dims2()?;
    let (mb, _) = b_mn.dims2()?;
    if m != m2 || m != mb || m == 0 {
        return Err(GpError::ShapeMismatch {
            context,
            expected: format!("{} x {} factor with {} rhs rows", m, m, m),
            got: format!("{} x {} factor with {} rhs rows", m, m2, mb),
        });
    }
    Ok(m)
}

/// Diagonal of the trailing two dims: (.., m, m) -> (.., m)
pub fn diag(a: &Tensor) -> Result<Tensor> {
    let m = a.dim(D::Minus1)?;
    let eye_mm = Tensor::eye(m, a.dtype(), a.device())?;
    Ok(a.broadcast_mul(&eye_mm)?.sum(D::Minus1)?)
}

/// `log det(K)` from its Cholesky factor: `2 Σ log L_ii`
pub fn log_det_from_cholesky(l_mm: &Tensor) -> Result<Tensor> {
    Ok((diag(l_mm)?.log()?.sum_all()? * 2.0)?)
}

/// `K + jitter * I`
pub fn add_jitter(k_mm: &Tensor, jitter: f64) -> Result<Tensor> {
    let (m, _) = k_mm.dims2()?;
    let eye_mm = (Tensor::eye(m, k_mm.dtype(), k_mm.device())? * jitter)?;
    Ok((k_mm + eye_mm)?)
}

/// Copy a tensor to host memory as `f64`
pub fn to_host_vec(x: &Tensor) -> Result<Vec<f64>> {
    Ok(x
        .flatten_all()?
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F64)?
        .to_vec1::<f64>()?)
}

/// Read a single-element tensor as `f64`
pub fn to_host_scalar(x: &Tensor) -> Result<f64> {
    let v = to_host_vec(x)?;
    if v.len() != 1 {
        return Err(GpError::ShapeMismatch {
            context: "to_host_scalar",
            expected: "a single element".into(),
            got: format!("{} elements", v.len()),
        });
    }
    Ok(v[0])
}

/// Fail with [`GpError::NonFinite`] if any entry is NaN or infinite
pub fn ensure_finite(x: &Tensor, what: &'static str) -> Result<()> {
    let total = to_host_scalar(&x.abs()?.sum_all()?)?;
    if total.is_finite() {
        Ok(())
    } else {
        Err(GpError::NonFinite(what))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{Init, VarBuilder, VarMap};

    fn spd_matrix(dev: &Device) -> candle_core::Result<Tensor> {
        let a = Tensor::from_vec(
            vec![2.0f64, 0.3, -0.1, 0.5, 1.0, 0.2, 0.0, 0.4, 1.5, 0.1, -0.3, 0.7],
            (4, 3),
            dev,
        )?;
        let eye = Tensor::eye(4, DType::F64, dev)?;
        a.matmul(&a.t()?)? + eye
    }

    #[test]
    fn cholesky_reconstructs() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let k = spd_matrix(&dev)?;
        let l = cholesky(&k)?;

        let recon = l.matmul(&l.t()?)?;
        let diff = (recon - &k)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f64>()?;
        assert!(diff < 1e-10, "max abs diff {}", diff);

        // strictly upper part is zero
        let upper = l.to_vec2::<f64>()?;
        for (i, row) in upper.iter().enumerate() {
            for &x in row.iter().skip(i + 1) {
                assert_eq!(x, 0.0);
            }
        }
        Ok(())
    }

    #[test]
    fn triangular_solves() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let k = spd_matrix(&dev)?;
        let l = cholesky(&k)?;
        let b = Tensor::from_vec(vec![1.0f64, 2.0, -1.0, 0.5, 3.0, 0.0, -2.0, 1.0], (4, 2), &dev)?;

        let x = solve_lower(&l, &b)?;
        let diff = (l.matmul(&x)? - &b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f64>()?;
        assert!(diff < 1e-10);

        let y = solve_lower_transpose(&l, &b)?;
        let diff = (l.t()?.matmul(&y)? - &b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f64>()?;
        assert!(diff < 1e-10);

        // K⁻¹ b through both solves
        let z = solve_lower_transpose(&l, &solve_lower(&l, &b)?)?;
        let diff = (k.matmul(&z)? - &b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f64>()?;
        assert!(diff < 1e-9);
        Ok(())
    }

    #[test]
    fn singular_matrix_fails_loudly() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        // two identical rows
        let k = Tensor::from_vec(
            vec![1.0f64, 1.0, 0.5, 1.0, 1.0, 0.5, 0.5, 0.5, 1.0],
            (3, 3),
            &dev,
        )?;
        match cholesky(&k) {
            Err(e @ GpError::NotPositiveDefinite { .. }) => assert!(e.is_numerical()),
            other => panic!("expected NotPositiveDefinite, got {:?}", other.map(|_| ())),
        }

        // jitter repairs it
        assert!(cholesky(&add_jitter(&k, 1e-6)?).is_ok());
        Ok(())
    }

    #[test]
    fn non_finite_input_is_rejected() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let k = Tensor::from_vec(vec![1.0f64, f64::NAN, f64::NAN, 1.0], (2, 2), &dev)?;
        let err = cholesky(&k).unwrap_err();
        assert!(err.is_numerical(), "{}", err);

        let x = Tensor::from_vec(vec![1.0f64, f64::INFINITY], 2, &dev)?;
        assert!(matches!(ensure_finite(&x, "x"), Err(GpError::NonFinite("x"))));
        assert!(ensure_finite(&spd_matrix(&dev)?, "k").is_ok());
        Ok(())
    }

    #[test]
    fn gradient_flows_through_cholesky() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &dev);
        let scale = vb.get_with_hints((), "scale", Init::Const(2.0))?;

        let k = spd_matrix(&dev)?.broadcast_mul(&scale)?;
        let l = cholesky(&k)?;
        let logdet = log_det_from_cholesky(&l)?;

        // d/ds log det(s K0) = m / s
        let grads = logdet.backward()?;
        let g = grads.get(&scale).expect("gradient for scale").to_scalar::<f64>()?;
        approx::assert_abs_diff_eq!(g, 4.0 / 2.0, epsilon = 1e-8);
        Ok(())
    }
}
