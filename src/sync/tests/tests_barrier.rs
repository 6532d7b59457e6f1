#[cfg(test)]
mod tests {
    use crate::sync::SequenceBarrier;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_returns_immediately_when_admitted() {
        let barrier = SequenceBarrier::new(5);
        barrier.wait(5);
        barrier.wait(3);
        assert_eq!(barrier.current(), 5);
    }

    #[test]
    fn test_arrive_admits_next_ticket() {
        let barrier = SequenceBarrier::new(1);
        barrier.arrive();
        assert_eq!(barrier.current(), 2);
        barrier.arrive_many(3);
        assert_eq!(barrier.current(), 5);
    }

    #[test]
    fn test_reset_rewinds_counter() {
        let barrier = SequenceBarrier::new(100);
        barrier.reset(7);
        assert_eq!(barrier.current(), 7);
    }

    #[test]
    fn test_tickets_serialize_across_threads() {
        // Four threads hold tickets 1..=4; each may only append its ticket
        // to the shared order once the barrier admits it.  The observed
        // order must be exactly ticket order regardless of scheduling.
        let barrier = Arc::new(SequenceBarrier::new(1));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        for ticket in 1..=4u64 {
            let barrier = Arc::clone(&barrier);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                barrier.wait(ticket);
                order.lock().unwrap().push(ticket);
                barrier.arrive();
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(barrier.current(), 5);
    }
}
