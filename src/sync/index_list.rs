// ============================================================================
// src/sync/index_list.rs - アリーナインデックスによる侵入型リスト
// ============================================================================
//!
//! 要素は固定長アリーナのインデックスで表し、リンク (`Link`) は
//! 呼び出し側が所有するスライスに格納する。挿入・削除は O(1) で、
//! 一切メモリ確保を行わない。
//!
//! 1つの要素は同時に1つのリストにしか属せない（リンクが1組のため）。

/// 要素ごとのリンク
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Link {
    prev: Option<usize>,
    next: Option<usize>,
    linked: bool,
}

impl Link {
    /// いずれかのリストに属しているか
    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

/// 侵入型の双方向リスト
#[derive(Debug, Clone, Default)]
pub struct IndexList {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl IndexList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    pub fn tail(&self) -> Option<usize> {
        self.tail
    }

    /// 次の要素
    pub fn next(&self, links: &[Link], index: usize) -> Option<usize> {
        links[index].next
    }

    /// 前の要素
    pub fn prev(&self, links: &[Link], index: usize) -> Option<usize> {
        links[index].prev
    }

    /// 末尾に追加
    pub fn push_back(&mut self, links: &mut [Link], index: usize) {
        debug_assert!(!links[index].linked, "element {} already linked", index);
        links[index] = Link {
            prev: self.tail,
            next: None,
            linked: true,
        };
        match self.tail {
            Some(tail) => links[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    /// 先頭に追加
    pub fn push_front(&mut self, links: &mut [Link], index: usize) {
        debug_assert!(!links[index].linked, "element {} already linked", index);
        links[index] = Link {
            prev: None,
            next: self.head,
            linked: true,
        };
        match self.head {
            Some(head) => links[head].prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
        self.len += 1;
    }

    /// `before` の直前に挿入
    pub fn insert_before(&mut self, links: &mut [Link], before: usize, index: usize) {
        debug_assert!(links[before].linked);
        let prev = links[before].prev;
        links[index] = Link {
            prev,
            next: Some(before),
            linked: true,
        };
        links[before].prev = Some(index);
        match prev {
            Some(prev) => links[prev].next = Some(index),
            None => self.head = Some(index),
        }
        self.len += 1;
    }

    /// リストから取り外す
    pub fn remove(&mut self, links: &mut [Link], index: usize) {
        debug_assert!(links[index].linked, "element {} not linked", index);
        let Link { prev, next, .. } = links[index];
        match prev {
            Some(prev) => links[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => links[next].prev = prev,
            None => self.tail = prev,
        }
        links[index] = Link::default();
        self.len -= 1;
    }

    /// 先頭を取り外して返す
    pub fn pop_front(&mut self, links: &mut [Link]) -> Option<usize> {
        let head = self.head?;
        self.remove(links, head);
        Some(head)
    }

    /// このリスト上に `index` があるか（線形探索）
    pub fn contains(&self, links: &[Link], index: usize) -> bool {
        links[index].linked && self.iter(links).any(|i| i == index)
    }

    /// 先頭から順に走査
    pub fn iter<'a>(&self, links: &'a [Link]) -> Iter<'a> {
        Iter {
            links,
            cursor: self.head,
        }
    }
}

/// `IndexList` のイテレータ
pub struct Iter<'a> {
    links: &'a [Link],
    cursor: Option<usize>,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let current = self.cursor?;
        self.cursor = self.links[current].next;
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(list: &IndexList, links: &[Link]) -> Vec<usize> {
        list.iter(links).collect()
    }

    #[test]
    fn test_push_and_remove() {
        let mut links = [Link::default(); 5];
        let mut list = IndexList::new();

        list.push_back(&mut links, 1);
        list.push_back(&mut links, 3);
        list.push_front(&mut links, 0);
        assert_eq!(collect(&list, &links), vec![0, 1, 3]);
        assert_eq!(list.len(), 3);

        list.remove(&mut links, 1);
        assert_eq!(collect(&list, &links), vec![0, 3]);
        assert!(!links[1].is_linked());

        assert_eq!(list.pop_front(&mut links), Some(0));
        assert_eq!(list.pop_front(&mut links), Some(3));
        assert_eq!(list.pop_front(&mut links), None);
        assert!(list.is_empty());
        assert_eq!(list.tail(), None);
    }

    #[test]
    fn test_insert_before_and_navigation() {
        let mut links = [Link::default(); 4];
        let mut list = IndexList::new();

        list.push_back(&mut links, 0);
        list.push_back(&mut links, 2);
        list.insert_before(&mut links, 2, 3);
        list.insert_before(&mut links, 0, 1);
        assert_eq!(collect(&list, &links), vec![1, 0, 3, 2]);

        assert_eq!(list.head(), Some(1));
        assert_eq!(list.next(&links, 0), Some(3));
        assert_eq!(list.prev(&links, 3), Some(0));
        assert_eq!(list.prev(&links, 1), None);
        assert!(list.contains(&links, 3));
    }

    #[test]
    fn test_two_lists_share_link_storage() {
        let mut links = [Link::default(); 4];
        let mut a = IndexList::new();
        let mut b = IndexList::new();

        a.push_back(&mut links, 0);
        a.push_back(&mut links, 1);
        b.push_back(&mut links, 2);
        b.push_back(&mut links, 3);

        a.remove(&mut links, 1);
        b.push_back(&mut links, 1);
        assert_eq!(collect(&a, &links), vec![0]);
        assert_eq!(collect(&b, &links), vec![2, 3, 1]);
        assert!(!a.contains(&links, 1));
    }
}
