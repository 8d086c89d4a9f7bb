//! Line-delimited JSON-RPC between the Mini App host and the client core.
//!
//! The host renders; every action it offers the user is a `tools/call`
//! here. Responses go to the writer, logs go to stderr.

use anyhow::Result;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::api::LotteryGateway;
use crate::use_cases::{AdminUseCase, PlayerUseCase};

#[derive(Debug, serde::Deserialize)]
struct JsonRpcRequest {
    #[serde(default = "default_jsonrpc")]
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    params: Option<Value>,
    id: Option<Value>,
}

fn default_jsonrpc() -> String {
    "2.0".to_string()
}

#[derive(Debug, serde::Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Option<Value>,
}

#[derive(Debug, serde::Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl JsonRpcResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id: Some(id.unwrap_or(json!(1))),
        }
    }

    fn failure(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct Tool {
    name: String,
    description: String,
    #[serde(rename = "inputSchema")]
    input_schema: Value,
}

fn tool(name: &str, description: &str, input_schema: Value) -> Tool {
    Tool {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

fn lottery_id_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "lottery_id": {
                "type": "integer",
                "description": "Lottery identifier"
            }
        },
        "required": ["lottery_id"]
    })
}

fn lottery_form_schema(with_id: bool) -> Value {
    let mut required = vec!["name", "ticket_price", "max_tickets"];
    if with_id {
        required.insert(0, "lottery_id");
    }
    json!({
        "type": "object",
        "properties": {
            "lottery_id": {"type": "integer", "description": "Lottery identifier"},
            "name": {"type": "string", "description": "Display name"},
            "ticket_price": {"type": "number", "description": "Price of one ticket in stars"},
            "max_tickets": {"type": "integer", "description": "Number of tickets, numbered from 1"}
        },
        "required": required
    })
}

pub struct BridgeHandler<G> {
    player: Arc<PlayerUseCase<G>>,
    admin: Arc<AdminUseCase<G>>,
}

impl<G> Clone for BridgeHandler<G> {
    fn clone(&self) -> Self {
        Self {
            player: Arc::clone(&self.player),
            admin: Arc::clone(&self.admin),
        }
    }
}

impl<G: LotteryGateway> BridgeHandler<G> {
    pub fn new(player: Arc<PlayerUseCase<G>>, admin: Arc<AdminUseCase<G>>) -> Self {
        Self { player, admin }
    }

    /// Serves requests until the reader hits end of input, then waits for
    /// tool calls still in flight.
    ///
    /// Each `tools/call` runs on its own task, so a slow purchase never
    /// blocks other tools; responses are written as they complete.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (responses, mut outbox) = mpsc::unbounded_channel::<JsonRpcResponse>();

        let read = async move {
            let mut lines = reader.lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }

                let request: JsonRpcRequest = match serde_json::from_str::<JsonRpcRequest>(&line) {
                    Ok(req) => req,
                    Err(e) => {
                        warn!("Failed to parse request: {} - Line: {}", e, line);
                        let mut response = JsonRpcResponse::failure(None, -32700, "Parse error".to_string());
                        if let Some(error) = response.error.as_mut() {
                            error.data = Some(json!(e.to_string()));
                        }
                        let _ = responses.send(response);
                        continue;
                    }
                };

                let is_notification = request.id.is_none() || request.method.starts_with("notifications/");
                if is_notification {
                    if request.method == "notifications/initialized" {
                        info!("🎰 Host initialized");
                    }
                    continue;
                }

                if request.method == "tools/call" {
                    let handler = self.clone();
                    let responses = responses.clone();
                    tokio::spawn(async move {
                        let response = handler.handle_call_tool(request.params, request.id).await;
                        let _ = responses.send(response);
                    });
                } else {
                    let _ = responses.send(self.handle_request(request));
                }
            }
            info!("host closed the bridge");
            anyhow::Ok(())
        };

        let write = async {
            while let Some(response) = outbox.recv().await {
                write_response(&mut writer, &response).await?;
            }
            anyhow::Ok(())
        };

        let (read, write) = tokio::join!(read, write);
        read?;
        write
    }

    fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        match request.method.as_str() {
            "initialize" => self.handle_initialize(request.id),
            "tools/list" => JsonRpcResponse::success(request.id, json!({ "tools": self.get_tools() })),
            _ => JsonRpcResponse::failure(
                Some(request.id.unwrap_or(json!(1))),
                -32601,
                format!("Method not found: {}", request.method),
            ),
        }
    }

    fn handle_initialize(&self, id: Option<Value>) -> JsonRpcResponse {
        info!("🎰 Initializing stars lottery bridge");
        JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {
                    "tools": {}
                },
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        )
    }

    async fn handle_call_tool(&self, params: Option<Value>, id: Option<Value>) -> JsonRpcResponse {
        let id = Some(id.unwrap_or(json!(1)));
        let Some(params) = params else {
            return JsonRpcResponse::failure(id, -32602, "Missing params".to_string());
        };
        let Some(tool_name) = params.get("name").and_then(|n| n.as_str()) else {
            return JsonRpcResponse::failure(id, -32602, "Missing tool name".to_string());
        };

        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
        let arguments_map: HashMap<String, Value> = serde_json::from_value(arguments).unwrap_or_default();

        match self.execute_tool(tool_name, &arguments_map).await {
            Ok(content) => JsonRpcResponse::success(
                id,
                json!({
                    "content": [
                        {
                            "type": "text",
                            "text": content
                        }
                    ]
                }),
            ),
            Err(e) => {
                warn!("tool {} failed: {:#}", tool_name, e);
                JsonRpcResponse::failure(id, -32603, format!("Tool execution error: {e:#}"))
            }
        }
    }

    async fn execute_tool(&self, tool_name: &str, arguments: &HashMap<String, Value>) -> Result<String> {
        match tool_name {
            "list_lotteries" => self.player.list_lotteries(arguments).await,
            "open_lottery" => self.player.open_lottery(arguments).await,
            "toggle_ticket" => self.player.toggle_ticket(arguments).await,
            "submit_purchase" => self.player.submit_purchase(arguments).await,
            "close_lottery" => self.player.close_lottery(arguments).await,
            "session_state" => self.player.session_state(arguments).await,
            "user_context" => self.player.user_context(arguments).await,
            "connect_wallet" => self.player.connect_wallet(arguments).await,
            "admin_login" => self.admin.login(arguments).await,
            "admin_list_lotteries" => self.admin.list_lotteries(arguments).await,
            "admin_create_lottery" => self.admin.create_lottery(arguments).await,
            "admin_update_lottery" => self.admin.update_lottery(arguments).await,
            "admin_delete_lottery" => self.admin.delete_lottery(arguments).await,
            "admin_draw" => self.admin.draw(arguments).await,
            "admin_lottery_stats" => self.admin.lottery_stats(arguments).await,
            "admin_open_lottery" => self.admin.open_lottery(arguments).await,
            _ => Err(anyhow::anyhow!("Unknown tool: {}", tool_name)),
        }
    }

    fn get_tools(&self) -> Vec<Tool> {
        let empty = || json!({ "type": "object", "properties": {} });
        vec![
            tool(
                "list_lotteries",
                "Current lottery snapshot split into active and finished",
                empty(),
            ),
            tool(
                "open_lottery",
                "Open a lottery's ticket grid with an empty selection",
                lottery_id_schema(),
            ),
            tool(
                "toggle_ticket",
                "Select or deselect a ticket number in the open lottery",
                json!({
                    "type": "object",
                    "properties": {
                        "number": {
                            "type": "integer",
                            "description": "Ticket number, 1 to max_tickets"
                        }
                    },
                    "required": ["number"]
                }),
            ),
            tool(
                "submit_purchase",
                "Buy every selected ticket in one all-or-nothing request",
                empty(),
            ),
            tool("close_lottery", "Close the ticket grid and drop the selection", empty()),
            tool("session_state", "Current ticket selection state", empty()),
            tool(
                "user_context",
                "Wallet, stars balance, TON rate and stats of the host user",
                json!({
                    "type": "object",
                    "properties": {
                        "refresh": {
                            "type": "boolean",
                            "description": "Reload from the API instead of the cached copy"
                        }
                    }
                }),
            ),
            tool(
                "connect_wallet",
                "Link a TON wallet address offered by the host",
                json!({
                    "type": "object",
                    "properties": {
                        "address": {
                            "type": "string",
                            "description": "TON address; omit to get the wallet app link"
                        }
                    }
                }),
            ),
            tool(
                "admin_login",
                "Log in to the operator console",
                json!({
                    "type": "object",
                    "properties": {
                        "token": {"type": "string", "description": "Admin token"}
                    },
                    "required": ["token"]
                }),
            ),
            tool("admin_list_lotteries", "All lotteries with sales figures", empty()),
            tool("admin_create_lottery", "Create a lottery", lottery_form_schema(false)),
            tool("admin_update_lottery", "Edit a lottery", lottery_form_schema(true)),
            tool("admin_delete_lottery", "Delete a lottery and its tickets", lottery_id_schema()),
            tool("admin_draw", "Draw the winner of a lottery", lottery_id_schema()),
            tool("admin_lottery_stats", "Tickets sold and revenue", lottery_id_schema()),
            tool(
                "admin_open_lottery",
                "Tickets, stats and result of a lottery",
                lottery_id_schema(),
            ),
        ]
    }
}

async fn write_response<W>(writer: &mut W, response: &JsonRpcResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut response_json = serde_json::to_string(response)?;
    response_json.push('\n');
    writer.write_all(response_json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub fn stdio() -> (BufReader<io::Stdin>, io::Stdout) {
    (BufReader::new(io::stdin()), io::stdout())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LotteryListCache;
    use crate::demo::DemoGateway;

    fn handler() -> BridgeHandler<DemoGateway> {
        let gateway = Arc::new(DemoGateway::seeded());
        let cache = Arc::new(LotteryListCache::new(Arc::clone(&gateway)));
        let player = PlayerUseCase::new(
            Arc::clone(&gateway),
            Arc::clone(&cache),
            Err(anyhow::anyhow!("authorization error: no init data")),
        );
        let admin = AdminUseCase::new(gateway, cache);
        BridgeHandler::new(Arc::new(player), Arc::new(admin))
    }

    async fn run(handler: &BridgeHandler<DemoGateway>, input: &str) -> Vec<Value> {
        let mut output = Vec::new();
        handler.serve(input.as_bytes(), &mut output).await.unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn protocol_errors_and_notifications() {
        let input = concat!(
            "{not json\n",
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n",
            "\n",
            "{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"bogus\"}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"tools/call\"}\n",
        );
        let responses = run(&handler(), input).await;
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0]["error"]["code"], -32700);
        assert_eq!(responses[1]["error"]["code"], -32601);
        assert_eq!(responses[2]["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn lists_every_tool() {
        let input = "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/list\"}\n";
        let responses = run(&handler(), input).await;
        let tools = responses[0]["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 16);
        assert!(tools.iter().any(|t| t["name"] == "submit_purchase"));
    }

    #[tokio::test]
    async fn player_tools_fail_without_identity() {
        let input = "{\"jsonrpc\":\"2.0\",\"id\":9,\"method\":\"tools/call\",\"params\":{\"name\":\"open_lottery\",\"arguments\":{\"lottery_id\":1}}}\n";
        let responses = run(&handler(), input).await;
        assert_eq!(responses[0]["error"]["code"], -32603);
        let message = responses[0]["error"]["message"].as_str().unwrap();
        assert!(message.contains("authorization error"), "{message}");
    }
}
