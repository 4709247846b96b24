use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use zone_ipc::{Client, EventPoll, IpcError, Service, ThreadDispatcher};

fn reactor() -> (Arc<EventPoll>, ThreadDispatcher) {
    let poll = Arc::new(EventPoll::new().unwrap());
    let dispatcher = ThreadDispatcher::new(Arc::clone(&poll)).unwrap();
    (poll, dispatcher)
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn echo_round_trip_and_peer_drain() {
    let (service_poll, _service_disp) = reactor();
    let (client_poll, _client_disp) = reactor();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("echo.socket");

    let mut service = Service::new(service_poll, &path).unwrap();
    service.set_method(1, |_, req: String, result: zone_ipc::MethodResult<String>| {
        result.set(&req.to_uppercase());
        Ok(())
    });
    service.start().unwrap();

    {
        let mut client = Client::new(client_poll).unwrap();
        client.connect_unix(&path).unwrap();

        let reply: String = client
            .call_sync(1, &"hi".to_string(), Duration::from_millis(2000))
            .unwrap();
        assert_eq!(reply, "HI");
        assert!(wait_until(Duration::from_millis(200), || service.peer_count() == 1));
    }

    // client dropped: the service sheds the peer promptly
    assert!(wait_until(Duration::from_millis(200), || service.peer_count() == 0));
}

#[test]
fn user_error_propagates() {
    let (service_poll, _service_disp) = reactor();
    let (client_poll, _client_disp) = reactor();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("err.socket");

    let mut service = Service::new(service_poll, &path).unwrap();
    service.set_method(5, |_, _req: String, result: zone_ipc::MethodResult<String>| {
        result.set_error(42, "not like this");
        Ok(())
    });
    service.start().unwrap();

    let mut client = Client::new(client_poll).unwrap();
    client.connect_unix(&path).unwrap();

    let reply: Result<String, _> =
        client.call_sync(5, &"x".to_string(), Duration::from_millis(2000));
    match reply {
        Err(IpcError::User { code, message }) => {
            assert_eq!(code, 42);
            assert_eq!(message, "not like this");
        }
        other => panic!("expected user error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn peer_disconnect_cancels_pending() {
    let (service_poll, _service_disp) = reactor();
    let (client_poll, _client_disp) = reactor();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hang.socket");

    let mut service = Service::new(service_poll, &path).unwrap();
    // never resolves: the result facade is dropped without replying
    service.set_method(2, |_, _req: String, _result: zone_ipc::MethodResult<String>| Ok(()));
    service.start().unwrap();

    let mut client = Client::new(client_poll).unwrap();
    client.connect_unix(&path).unwrap();

    let (tx, rx) = mpsc::channel();
    client
        .call_async::<String, String, _>(2, &"stall".to_string(), move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();

    // let the call reach the server, then kill the server mid-call
    std::thread::sleep(Duration::from_millis(100));
    drop(service);

    let outcome = rx.recv_timeout(Duration::from_millis(500)).unwrap();
    assert!(matches!(outcome, Err(IpcError::PeerDisconnected)));
}

#[test]
fn signal_broadcast_reaches_each_subscriber_once() {
    let (service_poll, _service_disp) = reactor();
    let (poll_a, _disp_a) = reactor();
    let (poll_b, _disp_b) = reactor();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("signal.socket");

    let mut service = Service::new(service_poll, &path).unwrap();
    service.start().unwrap();

    let hits_a = Arc::new(AtomicUsize::new(0));
    let hits_b = Arc::new(AtomicUsize::new(0));

    let mut client_a = Client::new(poll_a).unwrap();
    {
        let hits = Arc::clone(&hits_a);
        client_a.set_signal_handler(3, move |_, _data: String| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    client_a.connect_unix(&path).unwrap();

    let mut client_b = Client::new(poll_b).unwrap();
    {
        let hits = Arc::clone(&hits_b);
        client_b.set_signal_handler(3, move |_, _data: String| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    client_b.connect_unix(&path).unwrap();

    // both REGISTER_SIGNAL announcements must land before emitting
    assert!(wait_until(Duration::from_millis(500), || {
        service.peer_count() == 2
    }));
    std::thread::sleep(Duration::from_millis(100));

    service.signal(3, &"ping".to_string()).unwrap();

    assert!(wait_until(Duration::from_millis(500), || {
        hits_a.load(Ordering::SeqCst) == 1 && hits_b.load(Ordering::SeqCst) == 1
    }));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(hits_a.load(Ordering::SeqCst), 1);
    assert_eq!(hits_b.load(Ordering::SeqCst), 1);
}

#[test]
fn replies_arrive_in_call_order() {
    let (service_poll, _service_disp) = reactor();
    let (client_poll, _client_disp) = reactor();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("order.socket");

    let mut service = Service::new(service_poll, &path).unwrap();
    service.set_method(4, |_, req: u32, result: zone_ipc::MethodResult<u32>| {
        result.set(&req);
        Ok(())
    });
    service.start().unwrap();

    let mut client = Client::new(client_poll).unwrap();
    client.connect_unix(&path).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    for i in 0u32..8 {
        let order = Arc::clone(&order);
        let tx = tx.clone();
        client
            .call_async::<u32, u32, _>(4, &i, move |outcome| {
                order.lock().unwrap().push(outcome.unwrap());
                let _ = tx.send(());
            })
            .unwrap();
    }
    for _ in 0..8 {
        rx.recv_timeout(Duration::from_millis(2000)).unwrap();
    }
    assert_eq!(*order.lock().unwrap(), (0u32..8).collect::<Vec<_>>());
}
