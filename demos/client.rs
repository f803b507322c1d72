use argh::FromArgs;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use std::path::PathBuf;

mod messages;

// defaults for the client
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 3000;

#[derive(FromArgs)]
/// Client for the furniture placement server
struct ClientArgs {
    /// the host to connect to
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to connect to
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// command to execute: "generate" or "status"
    #[argh(subcommand)]
    command: ClientCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum ClientCommands {
    Generate(GenerateCommand),
    Status(StatusCommand),
}

#[derive(FromArgs)]
/// Ask for a furniture placement suggestion
#[argh(subcommand, name = "generate")]
struct GenerateCommand {
    /// URL of the empty room image
    #[argh(option)]
    image_url: Option<String>,

    /// path of the empty room image, as seen by the server
    #[argh(option, short = 'i')]
    image_path: Option<PathBuf>,

    /// local image file, sent base64 encoded
    #[argh(option)]
    upload: Option<PathBuf>,

    /// type of the room to design
    #[argh(option, short = 'r', default = "\"living room\".to_string()")]
    room_type: String,

    /// desired interior design style
    #[argh(option, short = 's', default = "\"industrial\".to_string()")]
    style: String,

    /// token budget of the placement stage (server default when omitted)
    #[argh(option)]
    max_tokens: Option<usize>,

    /// extra instruction appended to the placement request
    #[argh(option, short = 'n')]
    note: Option<String>,
}

#[derive(FromArgs)]
/// Show the state of the inference worker
#[argh(subcommand, name = "status")]
struct StatusCommand {}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: ClientArgs = argh::from_env();

    let client = reqwest::Client::new();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    match args.command {
        ClientCommands::Generate(command) => {
            let image_base64 = match &command.upload {
                Some(path) => Some(BASE64.encode(tokio::fs::read(path).await?)),
                None => None,
            };

            let response = client
                .post(format!("http://{}/generate", addr))
                .json(&messages::GenerateRequest {
                    room_type: command.room_type,
                    style: command.style,
                    image_url: command.image_url,
                    image_path: command.image_path,
                    image_base64,
                    max_tokens: command.max_tokens,
                    important_prompt: command.note,
                })
                .send()
                .await?;

            let status = response.status();
            let result = response.json::<serde_json::Value>().await?;
            println!("Result ({status}): {}", serde_json::to_string_pretty(&result)?);
        }
        ClientCommands::Status(_) => {
            let response = client
                .get(format!("http://{}/status", addr))
                .send()
                .await?;

            let result = response.json::<serde_json::Value>().await?;
            println!("Result: {}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}
