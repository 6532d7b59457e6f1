#[cfg(test)]
mod tests {
    use crate::fifo::IterableFifo;

    fn drain(fifo: &IterableFifo<u64>) -> Vec<u64> {
        let mut out = Vec::new();
        let mut cursor = fifo.iterate();
        while cursor.valid() {
            out.push(cursor.with(|v| *v).unwrap());
            cursor.next();
        }
        out
    }

    #[test]
    fn test_empty_queue() {
        let fifo: IterableFifo<u64> = IterableFifo::new();
        assert!(fifo.is_empty());
        assert!(!fifo.iterate().valid());
        assert!(fifo.with_oldest(|v| *v).is_none());
    }

    #[test]
    fn test_append_preserves_order() {
        let fifo = IterableFifo::new();
        for v in 1..=5u64 {
            fifo.append(v);
        }
        assert_eq!(drain(&fifo), vec![1, 2, 3, 4, 5]);
        assert!(!fifo.is_empty());
    }

    #[test]
    fn test_batch_append() {
        let fifo = IterableFifo::new();
        fifo.batch_append(vec![10, 20, 30]);
        assert_eq!(drain(&fifo), vec![10, 20, 30]);
    }

    #[test]
    fn test_remove_oldest() {
        let fifo = IterableFifo::new();
        fifo.batch_append(vec![1u64, 2, 3]);
        assert_eq!(fifo.with_oldest(|v| *v), Some(1));
        fifo.remove_oldest();
        assert_eq!(fifo.with_oldest(|v| *v), Some(2));
        fifo.remove_oldest();
        fifo.remove_oldest();
        assert!(fifo.is_empty());
        // Removing from an empty queue is a no-op.
        fifo.remove_oldest();
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_advance_to_cursor_position() {
        let fifo = IterableFifo::new();
        fifo.batch_append(vec![1u64, 2, 3, 4]);

        let mut cursor = fifo.iterate();
        cursor.next();
        cursor.next(); // consumed 1, 2; sitting on 3

        fifo.advance_to(&cursor);
        assert_eq!(drain(&fifo), vec![3, 4]);
    }

    #[test]
    fn test_append_after_drain() {
        let fifo = IterableFifo::new();
        fifo.append(1u64);
        fifo.remove_oldest();
        assert!(fifo.is_empty());
        fifo.append(2);
        assert_eq!(drain(&fifo), vec![2]);
    }
}
