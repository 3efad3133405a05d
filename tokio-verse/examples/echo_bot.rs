use std::env::args;
use std::process::exit;

use tokio_verse::stanza::{message, presence};
use tokio_verse::{Connection, Match, Options, Status};

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = args().collect();
    if args.len() != 4 {
        println!("Usage: {} <service-url> <jid> <password>", args[0]);
        exit(1);
    }
    let service = &args[1];
    let jid = &args[2];
    let password = &args[3];

    let mut conn = Connection::new(service.clone(), Options::default());

    // Echo every chat message back to its sender.
    conn.add_handler(
        Match::any().name("message").typ("chat"),
        Box::new(|conn, stanza| {
            let Some(from) = stanza.attr("from") else {
                return true;
            };
            let body = stanza
                .children()
                .find(|child| child.name() == "body")
                .map(|body| body.text())
                .unwrap_or_default();
            if body == "die" {
                println!("Secret die command triggered by {}", from);
                conn.disconnect(Some("told to die"));
                return false;
            }
            if !body.is_empty() {
                println!("echoing {:?} back to {}", body, from);
                conn.send(message(&[("to", from), ("type", "chat")]).c("body", &[]).t(&body));
            }
            true
        }),
    );

    conn.connect(
        jid,
        password,
        Box::new(|conn, status, condition, _elem| match status {
            Status::Connected => {
                println!("Online at {}", conn.jid().unwrap_or("unknown"));
                conn.send(presence(&[]).c("status", &[]).t("Echoing messages."));
            }
            Status::Disconnected => {
                println!("Disconnected ({:?})", condition);
            }
            status => println!("status: {:?} ({:?})", status, condition),
        }),
    )
    .expect("connect failed");

    conn.run().await.expect("connection loop failed");
}
