//! Systematic Reed-Solomon erasure codes over GF(2^8).
//!
//! The generator is derived from an n-by-k Vandermonde matrix whose top
//! k-by-k block is inverted and multiplied back in, leaving the first k
//! rows as the identity: source symbols pass through unchanged and rows
//! k..n produce parity. Decoding with up to n-k known erasure positions
//! solves the corresponding k-by-k subsystem by Gauss-Jordan elimination.
//!
//! Symbols are byte vectors of one shared length per block; the arithmetic
//! is integer so repaired symbols are bit-exact.

use crate::error::FecError;
use crate::galois::{addmul, gfdiv, gfmul, gfpow, GF_MAX};

/// An RS(n, k) erasure code: k source symbols, n - k parity symbols.
#[derive(Debug, Clone)]
pub struct ReedSolomon {
    n: usize,
    k: usize,
    /// Systematic generator, n rows by k columns, row-major.
    generator: Vec<u8>,
}

impl ReedSolomon {
    pub fn new(n: usize, k: usize) -> Result<Self, FecError> {
        if k == 0 || k > n || n > GF_MAX + 1 {
            return Err(FecError::InvalidParameters { n, k });
        }

        // Vandermonde: row i evaluates a degree-(k-1) polynomial at alpha^i.
        let mut vm = vec![0u8; n * k];
        for i in 0..n {
            for j in 0..k {
                vm[i * k + j] = gfpow((i * j) % GF_MAX);
            }
        }

        let mut top = vm[..k * k].to_vec();
        invert(&mut top, k)?;

        let mut generator = vec![0u8; n * k];
        // Identity rows for the sources, straight multiply for parity.
        for (i, row) in generator[..k * k].chunks_exact_mut(k).enumerate() {
            row[i] = 1;
        }
        for i in k..n {
            let row = &vm[i * k..(i + 1) * k];
            let out = &mut generator[i * k..(i + 1) * k];
            for (j, cell) in out.iter_mut().enumerate() {
                let mut acc = 0u8;
                for (x, &v) in row.iter().enumerate() {
                    acc ^= gfmul(v, top[x * k + j]);
                }
                *cell = acc;
            }
        }

        Ok(ReedSolomon { n, k, generator })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn parity_count(&self) -> usize {
        self.n - self.k
    }

    /// Produces the parity symbol with index `parity_index` (in `k..n`)
    /// from the k source symbols. `out` is zeroed first; all slices share
    /// `out`'s length.
    pub fn encode(
        &self,
        sources: &[&[u8]],
        parity_index: usize,
        out: &mut [u8],
    ) -> Result<(), FecError> {
        if sources.len() != self.k {
            return Err(FecError::WrongBlockSize {
                have: sources.len(),
                expect: self.k,
            });
        }
        if parity_index < self.k || parity_index >= self.n {
            return Err(FecError::BadOffset(parity_index));
        }
        out.fill(0);
        let row = &self.generator[parity_index * self.k..(parity_index + 1) * self.k];
        for (j, src) in sources.iter().enumerate() {
            addmul(out, src, row[j]);
        }
        Ok(())
    }

    /// Produces every parity symbol of the block at once.
    pub fn encode_block(
        &self,
        sources: &[&[u8]],
        parity: &mut [&mut [u8]],
    ) -> Result<(), FecError> {
        if parity.len() != self.parity_count() {
            return Err(FecError::WrongBlockSize {
                have: parity.len(),
                expect: self.parity_count(),
            });
        }
        for (h, out) in parity.iter_mut().enumerate() {
            self.encode(sources, self.k + h, out)?;
        }
        Ok(())
    }

    /// Repairs erased source symbols in place. `block` holds the k source
    /// positions; where a source was lost, the receiver has substituted a
    /// parity symbol and `offsets[i]` records which symbol (index in
    /// `0..n`) actually occupies position i. `offsets[i] == i` means the
    /// original source is intact.
    pub fn decode_parity_inline(
        &self,
        block: &mut [&mut [u8]],
        offsets: &[u8],
    ) -> Result<(), FecError> {
        if block.len() != self.k || offsets.len() != self.k {
            return Err(FecError::WrongBlockSize {
                have: block.len().min(offsets.len()),
                expect: self.k,
            });
        }
        let have: Vec<&[u8]> = block.iter().map(|s| &**s).collect();
        let repairs = self.solve(offsets, &have)?;
        drop(have);
        for (i, data) in repairs {
            block[i].copy_from_slice(&data);
        }
        Ok(())
    }

    /// Repairs erased source symbols when parity stays at its own appended
    /// positions: `block` holds all n symbols, `offsets[i]` names the
    /// symbol standing in for source i (itself, or a parity index whose
    /// data is read from `block[offsets[i]]`). Repairs land in `block[i]`.
    pub fn decode_parity_appended(
        &self,
        block: &mut [&mut [u8]],
        offsets: &[u8],
    ) -> Result<(), FecError> {
        if block.len() != self.n || offsets.len() != self.k {
            return Err(FecError::WrongBlockSize {
                have: block.len(),
                expect: self.n,
            });
        }
        for &off in offsets {
            if off as usize >= self.n {
                return Err(FecError::BadOffset(off as usize));
            }
        }
        let have: Vec<&[u8]> = offsets.iter().map(|&o| &*block[o as usize]).collect();
        let repairs = self.solve(offsets, &have)?;
        drop(have);
        for (i, data) in repairs {
            block[i].copy_from_slice(&data);
        }
        Ok(())
    }

    /// Builds and inverts the k-by-k decode matrix for the given symbol
    /// assignment, then reconstructs every erased source as a linear
    /// combination of the symbols on hand. `have[i]` is the data occupying
    /// source position i.
    fn solve(&self, offsets: &[u8], have: &[&[u8]]) -> Result<Vec<(usize, Vec<u8>)>, FecError> {
        let k = self.k;
        let mut erased = 0usize;
        let mut matrix = vec![0u8; k * k];
        for (i, &off) in offsets.iter().enumerate() {
            let off = off as usize;
            if off >= self.n {
                return Err(FecError::BadOffset(off));
            }
            if off != i {
                erased += 1;
            }
            matrix[i * k..(i + 1) * k]
                .copy_from_slice(&self.generator[off * k..(off + 1) * k]);
        }
        if erased == 0 {
            return Ok(Vec::new());
        }
        if erased > self.parity_count() {
            return Err(FecError::TooManyErasures);
        }
        invert(&mut matrix, k)?;

        let symbol_len = have[0].len();
        let mut repairs = Vec::with_capacity(erased);
        for (i, &off) in offsets.iter().enumerate() {
            if off as usize == i {
                continue;
            }
            let mut data = vec![0u8; symbol_len];
            let row = &matrix[i * k..(i + 1) * k];
            for (j, &c) in row.iter().enumerate() {
                addmul(&mut data, have[j], c);
            }
            repairs.push((i, data));
        }
        Ok(repairs)
    }
}

/// In-place Gauss-Jordan inversion of a k-by-k matrix over GF(2^8).
fn invert(matrix: &mut [u8], k: usize) -> Result<(), FecError> {
    let mut inverse = vec![0u8; k * k];
    for i in 0..k {
        inverse[i * k + i] = 1;
    }

    for col in 0..k {
        // Pivot: any row at or below the diagonal with a non-zero entry.
        let pivot = (col..k)
            .find(|&r| matrix[r * k + col] != 0)
            .ok_or(FecError::SingularMatrix)?;
        if pivot != col {
            for j in 0..k {
                matrix.swap(pivot * k + j, col * k + j);
                inverse.swap(pivot * k + j, col * k + j);
            }
        }

        let p = matrix[col * k + col];
        for j in 0..k {
            matrix[col * k + j] = gfdiv(matrix[col * k + j], p);
            inverse[col * k + j] = gfdiv(inverse[col * k + j], p);
        }

        for row in 0..k {
            if row == col {
                continue;
            }
            let factor = matrix[row * k + col];
            if factor == 0 {
                continue;
            }
            for j in 0..k {
                let m = gfmul(factor, matrix[col * k + j]);
                matrix[row * k + j] ^= m;
                let v = gfmul(factor, inverse[col * k + j]);
                inverse[row * k + j] ^= v;
            }
        }
    }

    matrix.copy_from_slice(&inverse);
    Ok(())
}
