/// An owned, read-only result set. Every operation returns a new set.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySet<T> {
    items: Vec<T>,
}

impl<T> QuerySet<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items }
    }

    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> QuerySet<U> {
        QuerySet::new(self.items.iter().map(f).collect())
    }

    pub fn filter(&self, mut predicate: impl FnMut(&T) -> bool) -> QuerySet<T>
    where
        T: Clone,
    {
        QuerySet::new(
            self.items
                .iter()
                .filter(|item| predicate(item))
                .cloned()
                .collect(),
        )
    }

    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<&T> {
        self.items.iter().find(|item| predicate(item))
    }

    pub fn reduce<A>(&self, init: A, f: impl FnMut(A, &T) -> A) -> A {
        self.items.iter().fold(init, f)
    }

    pub fn first(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<T> IntoIterator for QuerySet<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a QuerySet<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composed_queries_do_not_mutate() {
        let set = QuerySet::new(vec![1, 2, 3, 4]);
        let evens = set.filter(|n| n % 2 == 0);
        let doubled = evens.map(|n| n * 2);

        assert_eq!(set.len(), 4);
        assert_eq!(evens.into_vec(), vec![2, 4]);
        assert_eq!(doubled.into_vec(), vec![4, 8]);
    }

    #[test]
    fn test_find_and_reduce() {
        let set = QuerySet::new(vec![1, 2, 3]);
        assert_eq!(set.find(|n| *n > 1), Some(&2));
        assert_eq!(set.find(|n| *n > 5), None);
        assert_eq!(set.reduce(0, |acc, n| acc + n), 6);
    }

    #[test]
    fn test_empty_set() {
        let set: QuerySet<i32> = QuerySet::new(Vec::new());
        assert!(set.is_empty());
        assert!(set.first().is_none());
    }
}
