use anyhow::{anyhow, Result};
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use roadwatch::detect::BoundingBox;
use roadwatch::ptz::{ActuatorController, ActuatorError, PtzCommand, PtzConfig};

const REALM: &str = "IP Camera(E1234)";
const NONCE: &str = "4e6a4d7a4d6a59304f513d3d";
const USERNAME: &str = "admin";
const PASSWORD: &str = "hunter2";
const PTZ_PATH: &str = "/ISAPI/PTZCtrl/channels/1/continuous";

#[derive(Clone, Debug)]
struct Recorded {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: String,
    status: u16,
}

/// Minimal camera emulating the digest-protected continuous-move endpoint.
struct StubCamera {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Recorded>>>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl StubCamera {
    fn start(forced_status: Option<u16>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let join = {
            let requests = requests.clone();
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            if let Err(err) = serve(stream, &requests, forced_status) {
                                eprintln!("stub camera: {err}");
                            }
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(10));
                        }
                        Err(_) => break,
                    }
                }
            })
        };

        Ok(Self {
            addr,
            requests,
            shutdown,
            join: Some(join),
        })
    }

    fn url(&self) -> String {
        format!("http://{}{}", self.addr, PTZ_PATH)
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    fn wait_for_requests(&self, count: usize) -> Result<Vec<Recorded>> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let requests = self.requests();
            if requests.len() >= count {
                return Ok(requests);
            }
            if Instant::now() > deadline {
                return Err(anyhow!("saw {} of {} requests", requests.len(), count));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for StubCamera {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

fn digest_params(header: &str) -> HashMap<String, String> {
    header
        .trim_start_matches("Digest ")
        .split(", ")
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim_matches('"').to_string()))
        .collect()
}

fn authorized(headers: &HashMap<String, String>, method: &str) -> bool {
    let Some(header) = headers.get("authorization") else {
        return false;
    };
    let p = digest_params(header);
    let get = |k: &str| p.get(k).cloned().unwrap_or_default();
    let ha1 = md5_hex(&format!("{}:{}:{}", get("username"), REALM, PASSWORD));
    let ha2 = md5_hex(&format!("{}:{}", method, get("uri")));
    let expected = md5_hex(&format!(
        "{}:{}:{}:{}:auth:{}",
        ha1,
        NONCE,
        get("nc"),
        get("cnonce"),
        ha2
    ));
    get("username") == USERNAME && get("realm") == REALM && get("response") == expected
}

fn serve(
    stream: TcpStream,
    requests: &Mutex<Vec<Recorded>>,
    forced_status: Option<u16>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let len: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;

    let status = if !authorized(&headers, &method) {
        401
    } else {
        forced_status.unwrap_or(200)
    };
    requests.lock().unwrap().push(Recorded {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&body).to_string(),
        status,
    });

    let mut stream = stream;
    let response = match status {
        401 => format!(
            "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Digest realm=\"{REALM}\", qop=\"auth\", nonce=\"{NONCE}\", stale=\"FALSE\"\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        ),
        200 => "HTTP/1.1 200 OK\r\nContent-Type: application/xml\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
        code => format!(
            "HTTP/1.1 {code} Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        ),
    };
    stream.write_all(response.as_bytes())?;
    stream.flush()?;
    Ok(())
}

fn config(url: String, password: &str) -> PtzConfig {
    PtzConfig {
        url,
        username: USERNAME.to_string(),
        password: password.to_string(),
        timeout: Duration::from_secs(2),
        min_interval: Duration::from_millis(20),
    }
}

#[test]
fn answers_digest_challenge_and_reuses_it() -> Result<()> {
    let camera = StubCamera::start(None)?;
    let mut controller = ActuatorController::spawn(config(camera.url(), PASSWORD))?;

    controller.dispatch_now(&PtzCommand::new(-50, 0, 0))?;
    let requests = camera.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].status, 401);
    assert_eq!(requests[1].status, 200);
    assert_eq!(requests[1].method, "PUT");
    assert_eq!(requests[1].path, PTZ_PATH);
    assert_eq!(
        requests[1].headers.get("content-type").map(String::as_str),
        Some("application/xml")
    );
    assert_eq!(
        requests[1].body,
        "<PTZData><pan>-50</pan><tilt>0</tilt><zoom>0</zoom></PTZData>"
    );

    controller.dispatch_now(&PtzCommand::new(12, 0, 0))?;
    let requests = camera.requests();
    assert_eq!(requests.len(), 3, "cached challenge should skip the 401");
    assert_eq!(requests[2].status, 200);
    let nc = digest_params(&requests[2].headers["authorization"])["nc"].clone();
    assert_eq!(nc, "00000002");

    controller.shutdown();
    Ok(())
}

#[test]
fn wrong_password_is_an_auth_error() -> Result<()> {
    let camera = StubCamera::start(None)?;
    let controller = ActuatorController::spawn(config(camera.url(), "wrong"))?;

    let err = controller
        .dispatch_now(&PtzCommand::new(10, 0, 0))
        .unwrap_err();
    assert!(matches!(err, ActuatorError::Auth(_)), "{err}");
    assert_eq!(controller.stats().failed, 1);
    Ok(())
}

#[test]
fn non_200_status_is_reported() -> Result<()> {
    let camera = StubCamera::start(Some(500))?;
    let controller = ActuatorController::spawn(config(camera.url(), PASSWORD))?;

    let err = controller
        .dispatch_now(&PtzCommand::new(10, 0, 0))
        .unwrap_err();
    assert!(matches!(err, ActuatorError::Status(500)), "{err}");
    Ok(())
}

#[test]
fn center_on_dispatches_in_background_and_stops_on_shutdown() -> Result<()> {
    let camera = StubCamera::start(None)?;
    let mut controller = ActuatorController::spawn(config(camera.url(), PASSWORD))?;

    let flush_left = BoundingBox::new(-10.0, 0.0, 10.0, 40.0);
    controller.center_on(&flush_left, 640)?;
    let requests = camera.wait_for_requests(2)?;
    assert!(requests[1].body.contains("<pan>-50</pan>"));

    controller.shutdown();
    let last = camera.requests().pop().expect("stop command");
    assert_eq!(last.status, 200);
    assert_eq!(
        last.body,
        "<PTZData><pan>0</pan><tilt>0</tilt><zoom>0</zoom></PTZData>"
    );
    Ok(())
}

#[test]
fn unreachable_camera_never_blocks_center_on() -> Result<()> {
    // Bind then drop to get a port nobody listens on.
    let port = TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();
    let url = format!("http://127.0.0.1:{port}{PTZ_PATH}");
    let mut controller = ActuatorController::spawn(config(url, PASSWORD))?;

    let started = Instant::now();
    for x in [100.0, 200.0, 300.0] {
        controller.center_on(&BoundingBox::new(x, 0.0, x + 20.0, 20.0), 640)?;
    }
    assert!(started.elapsed() < Duration::from_millis(100));

    let deadline = Instant::now() + Duration::from_secs(5);
    while controller.stats().failed == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(controller.stats().failed >= 1);
    assert_eq!(controller.stats().submitted, 3);

    controller.shutdown();
    Ok(())
}
