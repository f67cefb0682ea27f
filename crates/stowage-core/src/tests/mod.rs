mod compact;
