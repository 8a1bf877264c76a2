//! TCP echo server on the weft runtime
//!
//! One fiber accepts; every connection gets its own fiber. Thousands of
//! connections share the small worker pool without any callback plumbing.
//!
//! ```text
//! WEFT_ECHO_PORT=9000 WEFT_ECHO_WORKERS=4 weft-echo
//! ```

use log::{error, info};
use weft::{IoManager, Ipv4Address, Socket, Task};

fn serve(conn: Socket) {
    let peer = conn
        .remote_address()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "?".into());
    info!("connected: {}", peer);

    let mut buf = [0u8; 4096];
    loop {
        match conn.recv(&mut buf, 0) {
            Ok(0) => break,
            Ok(n) => {
                let mut sent = 0;
                while sent < n {
                    match conn.send(&buf[sent..n], 0) {
                        Ok(m) => sent += m,
                        Err(e) => {
                            error!("send to {} failed: {}", peer, e);
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                error!("recv from {} failed: {}", peer, e);
                break;
            }
        }
    }
    info!("closed: {}", peer);
}

fn main() {
    env_logger::init();

    let port: u16 = weft::env_get("WEFT_ECHO_PORT", 8080);
    let workers: usize = weft::env_get("WEFT_ECHO_WORKERS", 4);

    let iom = IoManager::new(workers, false, "echo").expect("runtime startup failed");

    iom.schedule(Task::call(move || {
        let listener = Socket::tcp_v4();
        listener
            .bind(&Ipv4Address::any(port).into())
            .expect("bind failed");
        listener.listen(1024).expect("listen failed");
        info!("listening on {}", listener.local_address().unwrap());

        loop {
            match listener.accept() {
                Ok(conn) => weft::spawn(move || serve(conn)),
                Err(e) => {
                    error!("accept failed: {}", e);
                    weft::sleep_ms(10);
                }
            }
        }
    }));

    // Workers own the event loop from here on.
    loop {
        std::thread::park();
    }
}
