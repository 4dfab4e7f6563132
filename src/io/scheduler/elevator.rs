// ============================================================================
// src/io/scheduler/elevator.rs - エレベータ（SCAN）ソート
// ============================================================================
//!
//! バッチ内のオペレーションをデバイスオフセット順に並べ、
//! 重なりのないパスに分割する。各パスの中では、どのオペレーションも
//! 直前のオペレーションの終端以降から始まる。
//!
//! 最初のパスは前回のバッチで最後に転送した位置（ヘッド位置）から、
//! 以降のパスはオフセット0から始まる。

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::io::operation::IoOperation;

/// デバイス上の範囲
pub trait Extent {
    fn offset(&self) -> u64;
    fn length(&self) -> u64;
}

impl Extent for Arc<IoOperation> {
    fn offset(&self) -> u64 {
        IoOperation::offset(self)
    }

    fn length(&self) -> u64 {
        IoOperation::length(self)
    }
}

/// オペレーションをエレベータ順に並べ替え、パス数を返す
///
/// `scratch` は作業用（呼び出し後は空）。`head` は現在のヘッド位置で、
/// 最後に受け入れたオペレーションの終端に更新される。
pub fn sort_operations<T: Extent + Clone>(
    operations: &mut Vec<T>,
    scratch: &mut Vec<T>,
    head: &mut u64,
) -> usize {
    if operations.is_empty() {
        return 0;
    }

    // オフセット昇順、同じオフセットなら長い方を先に
    operations.sort_by(|a, b| {
        a.offset()
            .cmp(&b.offset())
            .then_with(|| b.length().cmp(&a.length()))
    });

    scratch.clear();
    let mut passes = 0;
    let mut position = *head;
    while !operations.is_empty() {
        let before = scratch.len();
        operations.retain(|op| {
            if op.offset() < position {
                return true;
            }
            position = op.offset() + op.length();
            scratch.push(op.clone());
            false
        });
        if scratch.len() > before {
            passes += 1;
            *head = position;
        }
        position = 0;
    }

    core::mem::swap(operations, scratch);
    passes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Range(u64, u64);

    impl Extent for Range {
        fn offset(&self) -> u64 {
            self.0
        }

        fn length(&self) -> u64 {
            self.1
        }
    }

    fn sort(ranges: &[Range], head: &mut u64) -> (Vec<Range>, usize) {
        let mut ops = ranges.to_vec();
        let mut scratch = Vec::new();
        let passes = sort_operations(&mut ops, &mut scratch, head);
        assert!(scratch.is_empty());
        (ops, passes)
    }

    #[test]
    fn test_single_pass_from_zero() {
        let mut head = 0;
        let (ops, passes) = sort(&[Range(8192, 512), Range(0, 4096), Range(4096, 512)], &mut head);
        assert_eq!(ops, vec![Range(0, 4096), Range(4096, 512), Range(8192, 512)]);
        assert_eq!(passes, 1);
        assert_eq!(head, 8704);
    }

    #[test]
    fn test_overlaps_start_new_pass() {
        let mut head = 0;
        let (ops, passes) = sort(
            &[Range(0, 512), Range(0, 4096), Range(1024, 512), Range(8192, 512)],
            &mut head,
        );
        // 長い方が先に受け入れられ、重なるものは次のパスへ
        assert_eq!(
            ops,
            vec![Range(0, 4096), Range(8192, 512), Range(0, 512), Range(1024, 512)]
        );
        assert_eq!(passes, 2);
        assert_eq!(head, 1536);
    }

    #[test]
    fn test_first_pass_starts_at_head() {
        let mut head = 5000;
        let (ops, passes) = sort(&[Range(0, 512), Range(4096, 512), Range(6000, 512)], &mut head);
        assert_eq!(ops, vec![Range(6000, 512), Range(0, 512), Range(4096, 512)]);
        assert_eq!(passes, 2);
        assert_eq!(head, 4608);
    }

    #[test]
    fn test_passes_are_non_overlapping() {
        let mut head = 3000;
        let input: Vec<Range> = (0..40u64)
            .map(|i| Range((i * 7919) % 20_000, 512 + (i % 5) * 512))
            .collect();
        let (ops, passes) = sort(&input, &mut head);
        assert_eq!(ops.len(), input.len());

        // パス境界はオフセットが後退する箇所
        let observed = 1 + ops
            .windows(2)
            .filter(|pair| pair[1].0 < pair[0].0 + pair[0].1)
            .count();
        assert_eq!(observed, passes);
    }

    #[test]
    fn test_empty_batch() {
        let mut head = 42;
        let (ops, passes) = sort(&[], &mut head);
        assert!(ops.is_empty());
        assert_eq!(passes, 0);
        assert_eq!(head, 42);
    }
}
