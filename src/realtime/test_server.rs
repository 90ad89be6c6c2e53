//! Scripted websocket server for exercising the stream client end to end.

use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, header};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

pub(crate) enum Script {
    Reject(u16),
    Accept(Vec<Step>),
}

pub(crate) enum Step {
    Send(Value),
    SendText(String),
    ExpectSubscription,
    Sleep(Duration),
    Close(u16, &'static str),
    /// Drops the socket without a close handshake.
    Drop,
    /// Keeps the socket open until the client goes away.
    Hold,
}

#[derive(Debug, Clone)]
pub(crate) struct Handshake {
    pub path: String,
    pub authorization: Option<String>,
}

pub(crate) struct TestServer {
    pub base_url: String,
    handshakes: Arc<Mutex<Vec<Handshake>>>,
    subscriptions: Arc<Mutex<Vec<Value>>>,
    task: JoinHandle<()>,
}

impl TestServer {
    /// `script` is called with the zero-based index of each incoming connection.
    pub async fn spawn<F>(script: F) -> Self
    where
        F: Fn(usize) -> Script + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
        let addr = listener.local_addr().expect("test server addr");
        let handshakes: Arc<Mutex<Vec<Handshake>>> = Arc::default();
        let subscriptions: Arc<Mutex<Vec<Value>>> = Arc::default();

        let task = tokio::spawn({
            let handshakes = Arc::clone(&handshakes);
            let subscriptions = Arc::clone(&subscriptions);
            async move {
                let mut index = 0;
                while let Ok((stream, _)) = listener.accept().await {
                    let script = script(index);
                    index += 1;
                    tokio::spawn(serve(
                        stream,
                        script,
                        Arc::clone(&handshakes),
                        Arc::clone(&subscriptions),
                    ));
                }
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            handshakes,
            subscriptions,
            task,
        }
    }

    pub fn handshakes(&self) -> Vec<Handshake> {
        self.handshakes.lock().expect("handshakes lock").clone()
    }

    pub fn connections(&self) -> usize {
        self.handshakes.lock().expect("handshakes lock").len()
    }

    pub async fn wait_for_subscriptions(&self, count: usize) -> Vec<Value> {
        for _ in 0..400 {
            let received = self.subscriptions.lock().expect("subscriptions lock").clone();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("server did not receive {count} subscription message(s)");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    stream: TcpStream,
    script: Script,
    handshakes: Arc<Mutex<Vec<Handshake>>>,
    subscriptions: Arc<Mutex<Vec<Value>>>,
) {
    let reject = match &script {
        Script::Reject(status) => Some(*status),
        Script::Accept(_) => None,
    };
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let authorization = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        handshakes.lock().expect("handshakes lock").push(Handshake {
            path: request.uri().path().to_string(),
            authorization,
        });
        match reject {
            Some(status) => {
                let mut error = ErrorResponse::new(Some("rejected by test server".to_string()));
                *error.status_mut() = StatusCode::from_u16(status).expect("status code");
                Err(error)
            }
            None => Ok(response),
        }
    };

    let Ok(mut ws) = accept_hdr_async(stream, callback).await else {
        return;
    };
    let Script::Accept(steps) = script else {
        return;
    };

    for step in steps {
        match step {
            Step::Send(value) => {
                if ws.send(Message::Text(value.to_string())).await.is_err() {
                    return;
                }
            }
            Step::SendText(text) => {
                if ws.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            Step::ExpectSubscription => loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(value) = serde_json::from_str::<Value>(&text) {
                            subscriptions.lock().expect("subscriptions lock").push(value);
                        }
                        break;
                    }
                    Some(Ok(_)) => continue,
                    _ => return,
                }
            },
            Step::Sleep(duration) => tokio::time::sleep(duration).await,
            Step::Close(code, reason) => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: Cow::Borrowed(reason),
                };
                let _ = ws.close(Some(frame)).await;
                while let Some(Ok(_)) = ws.next().await {}
                return;
            }
            Step::Drop => return,
            Step::Hold => {
                while let Some(Ok(_)) = ws.next().await {}
                return;
            }
        }
    }
}
