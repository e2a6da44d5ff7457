/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    SignIn { username: String, password: String },
    SignUp { username: String, password: String },
    SignOut,
    Join(String),
    Channels,
    Attach { path: String, text: String },
    Reload,
    Reconnect,
    Help,
    Quit,
    Send(String),
}

pub const HELP: &str = "\
/signin <user> <password>   sign in
/signup <user> <password>   create an account
/logout                     sign out
/join <channel>             switch channel
/channels                   list channels
/attach <path> [text]       send a file with optional text
/reload                     reload the channel list
/reconnect                  reconnect the transport
/help                       show this list
/quit                      exit
anything else is sent to the active channel";

pub fn parse_line(line: &str) -> Result<Option<Input>, String> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() {
        return Ok(None);
    }
    let Some(rest) = trimmed.trim_start().strip_prefix('/') else {
        return Ok(Some(Input::Send(trimmed.to_string())));
    };

    let (command, args) = match rest.split_once(char::is_whitespace) {
        Some((command, args)) => (command, args.trim()),
        None => (rest, ""),
    };
    let input = match command {
        "signin" | "login" => {
            let (username, password) = credentials(args)?;
            Input::SignIn { username, password }
        }
        "signup" => {
            let (username, password) = credentials(args)?;
            Input::SignUp { username, password }
        }
        "logout" | "signout" => Input::SignOut,
        "join" => {
            if args.is_empty() {
                return Err("usage: /join <channel>".into());
            }
            Input::Join(args.to_string())
        }
        "channels" => Input::Channels,
        "attach" => {
            let (path, text) = match args.split_once(char::is_whitespace) {
                Some((path, text)) => (path, text.trim_start()),
                None => (args, ""),
            };
            if path.is_empty() {
                return Err("usage: /attach <path> [text]".into());
            }
            Input::Attach {
                path: path.to_string(),
                text: text.to_string(),
            }
        }
        "reload" => Input::Reload,
        "reconnect" => Input::Reconnect,
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => return Err(format!("unknown command '/{other}', try /help")),
    };
    Ok(Some(input))
}

fn credentials(args: &str) -> Result<(String, String), String> {
    match args.split_once(char::is_whitespace) {
        Some((username, password)) => Ok((username.to_string(), password.trim_start().to_string())),
        None => Ok((args.to_string(), String::new())),
    }
}
